//! Contract tests for the pieces the HTTP layer leans on: domain error →
//! status-code mapping, the error body shape, and event delivery. These
//! run without a database.

mod error_mapping_tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tokenpool::errors::AppError;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn already_active_maps_to_422_with_detail() {
        let response = AppError::AlreadyHasActiveToken.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(response).await;
        assert_eq!(json["errors"]["detail"], "user already has an active token");
    }

    #[tokio::test]
    async fn no_tokens_maps_to_422() {
        let response = AppError::NoTokensAvailable.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(response).await;
        assert_eq!(json["errors"]["detail"], "no tokens available");
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = AppError::TokenNotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["errors"]["detail"], "token not found");
    }

    #[tokio::test]
    async fn database_errors_map_to_500_without_leaking_detail() {
        let response = AppError::Database(sqlx::Error::PoolTimedOut).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["errors"]["detail"], "internal server error");
    }
}

mod event_tests {
    use chrono::Utc;
    use tokenpool::events::{EventBus, TokenEvent};
    use uuid::Uuid;

    #[test]
    fn activation_event_reaches_global_and_token_topics() {
        let bus = EventBus::new();
        let token_id = Uuid::new_v4();
        let mut all = bus.subscribe_all();
        let mut one = bus.subscribe(token_id);

        let event = TokenEvent::Activated {
            token_id,
            user_id: Uuid::new_v4(),
            activated_at: Utc::now(),
        };
        bus.publish(event.clone());

        assert_eq!(all.try_recv().unwrap(), event);
        assert_eq!(one.try_recv().unwrap(), event);
    }

    #[test]
    fn release_event_carries_only_the_token_id() {
        let bus = EventBus::new();
        let mut all = bus.subscribe_all();
        let token_id = Uuid::new_v4();

        bus.publish(TokenEvent::Released { token_id });

        match all.try_recv().unwrap() {
            TokenEvent::Released { token_id: got } => assert_eq!(got, token_id),
            other => panic!("expected release event, got {:?}", other),
        }
    }
}

mod model_tests {
    use tokenpool::models::token::{LEASE_SECONDS, POOL_SIZE};

    #[test]
    fn pool_constants_match_the_product_contract() {
        assert_eq!(POOL_SIZE, 100);
        assert_eq!(LEASE_SECONDS, 120);
    }
}
