//! Durability of the confirmations state across restarts.

#[cfg(test)]
mod persistence_tests {
    use adrewards_confirmations::testing::MockConfirmationsServer;
    use adrewards_confirmations::{
        AdType, CatalogIssuersStore, ConfirmationType, Confirmations, ConfirmationsConfig,
        ConfirmationsDelegates, ConfirmationsError, ConfirmationsStateStore, PaymentTokenStore,
        PendingConfirmationStore, RedeemOutcome, RedeemUnblindedToken, RewardConfirmation,
        UnblindedTokenStore, WalletInfo,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<ConfirmationsStateStore> {
        Arc::new(ConfirmationsStateStore::open(dir.path().join("confirmations.json")).unwrap())
    }

    fn confirmations(
        server: &Arc<MockConfirmationsServer>,
        store: Arc<ConfirmationsStateStore>,
        wallet: &WalletInfo,
    ) -> Confirmations {
        let confirmations = Confirmations::new(
            ConfirmationsConfig::default()
                .with_token_thresholds(2, 4)
                .with_privacy_jitter(false),
            store,
            server.clone(),
            ConfirmationsDelegates::default(),
        )
        .unwrap();
        confirmations.set_wallet(wallet.clone()).unwrap();
        confirmations
            .set_catalog_issuers(server.catalog_issuers())
            .unwrap();
        confirmations
    }

    fn redeemer(
        server: &Arc<MockConfirmationsServer>,
        store: Arc<ConfirmationsStateStore>,
    ) -> RedeemUnblindedToken {
        let issuers = Arc::new(CatalogIssuersStore::new());
        issuers.set(server.catalog_issuers()).unwrap();
        RedeemUnblindedToken::new(
            store.clone(),
            store.clone(),
            store,
            server.clone(),
            issuers,
            None,
        )
    }

    fn view() -> RewardConfirmation {
        RewardConfirmation::new(
            "creative",
            "placement",
            ConfirmationType::View,
            AdType::InlineContentAd,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MockConfirmationsServer::new());
        let wallet = WalletInfo::generate("payment");

        let before = {
            let confirmations = confirmations(&server, open(&dir), &wallet);
            confirmations.initialize().await.unwrap();
            confirmations.start().await.unwrap();
            confirmations.confirm(view()).await.unwrap();
            confirmations.status().await.unwrap()
        };
        assert_eq!(before.unblinded_tokens, 3);
        assert_eq!(before.unblinded_payment_tokens, 1);

        let confirmations = confirmations(&server, open(&dir), &wallet);
        assert_eq!(confirmations.initialize().await.unwrap(), 0);
        let after = confirmations.status().await.unwrap();
        assert_eq!(after.unblinded_tokens, before.unblinded_tokens);
        assert_eq!(after.unblinded_payment_tokens, before.unblinded_payment_tokens);
        assert_eq!(after.next_token_redemption_at, before.next_token_redemption_at);
    }

    #[tokio::test]
    async fn test_queued_confirmation_survives_restart() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MockConfirmationsServer::new());
        let wallet = WalletInfo::generate("payment");

        {
            // No issuers yet, so the confirmation stays queued.
            let confirmations = Confirmations::new(
                ConfirmationsConfig::default().with_token_thresholds(1, 4),
                open(&dir),
                server.clone(),
                ConfirmationsDelegates::default(),
            )
            .unwrap();
            confirmations.set_wallet(wallet.clone()).unwrap();
            confirmations.confirm(view()).await.unwrap();
        }

        let store = open(&dir);
        store
            .put(server.issue_unblinded_tokens(2, &wallet))
            .await
            .unwrap();
        let confirmations = confirmations(&server, store, &wallet);
        assert_eq!(confirmations.status().await.unwrap().queued_confirmations, 1);

        let summary = confirmations.process_confirmations().await.unwrap();
        assert_eq!(summary.redeemed, 1);
        assert_eq!(confirmations.payment_token_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_token_in_flight_at_crash_is_recovered() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MockConfirmationsServer::new());
        let wallet = WalletInfo::generate("payment");

        let reserved = {
            let store = open(&dir);
            store
                .put(server.issue_unblinded_tokens(3, &wallet))
                .await
                .unwrap();
            store.reserve().await.unwrap().unwrap()
        };

        let store = open(&dir);
        assert_eq!(UnblindedTokenStore::count(&*store).await.unwrap(), 2);
        assert_eq!(store.in_flight_count().await.unwrap(), 1);

        let confirmations = confirmations(&server, store.clone(), &wallet);
        assert_eq!(confirmations.initialize().await.unwrap(), 1);
        assert_eq!(store.get().await.unwrap(), Some(reserved));
        assert_eq!(store.in_flight_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confirmations.json");
        std::fs::write(&path, b"{\"unblinded_tokens\": [").unwrap();

        let result = ConfirmationsStateStore::open(&path);
        assert!(matches!(result, Err(ConfirmationsError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_pending_confirmation_is_resent_after_restart() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(MockConfirmationsServer::new());
        let wallet = WalletInfo::generate("payment");
        let reward = view();

        {
            let store = open(&dir);
            store
                .put(server.issue_unblinded_tokens(2, &wallet))
                .await
                .unwrap();
            server.lose_next_create_response();
            let outcome = redeemer(&server, store.clone())
                .redeem(&wallet, &reward)
                .await;
            assert!(matches!(
                outcome,
                RedeemOutcome::Failed {
                    should_retry: true,
                    ..
                }
            ));

            // Stop while the resend holds the token in flight.
            let token = store.get().await.unwrap().unwrap();
            assert!(store.reclaim(&token).await.unwrap());
        }

        let store = open(&dir);
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert_eq!(store.recover_in_flight().await.unwrap(), 1);

        let outcome = redeemer(&server, store.clone())
            .redeem(&wallet, &reward)
            .await;
        assert!(matches!(outcome, RedeemOutcome::Redeemed(_)), "{:?}", outcome);
        assert_eq!(server.double_spend_attempts(), 0);
        assert_eq!(server.spent_token_count(), 1);
        assert_eq!(PaymentTokenStore::count(&*store).await.unwrap(), 1);
        assert_eq!(UnblindedTokenStore::count(&*store).await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }
}
