//! Conversation history for the calling user.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::{blocking, ApiError, CallerId};
use crate::state::AppState;
use chatrelay_core::Error;
use chatrelay_store::{ConversationDetail, ConversationSummary, Page};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/{id}", get(get_conversation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub app_code: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}

/// GET /api/conversations?appCode=&page=&size=: newest first.
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    CallerId(caller): CallerId,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<ConversationSummary>>, ApiError> {
    let app_code = query
        .app_code
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::InvalidRequest("appCode is required".into()))?;
    let page = query.page.unwrap_or(1).max(1);
    let size = query
        .size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let user_id = caller.unwrap_or(state.config.system_user_id);

    let store = state.store.clone();
    let listing =
        blocking(move || store.list_conversations(&app_code, user_id, page, size)).await?;
    Ok(Json(listing))
}

/// GET /api/conversations/{id}: full transcript. Conversations owned by
/// another user are reported as missing.
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    CallerId(caller): CallerId,
    Path(id): Path<i64>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let user_id = caller.unwrap_or(state.config.system_user_id);
    let store = state.store.clone();

    let detail = blocking(move || {
        match store.get_conversation(id)? {
            Some(c) if c.user_id == user_id => {}
            _ => return Ok(None),
        }
        store.get_conversation_detail(id)
    })
    .await?;

    detail
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("Conversation {}", id))))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{body_string, test_app};
    use super::super::USER_ID_HEADER;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chatrelay_store::{NewConversation, NewMessage, Role, TokenUsage};
    use tower::ServiceExt;

    fn get(uri: &str, user: &str) -> Request<Body> {
        Request::get(uri)
            .header(USER_ID_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_and_detail() {
        let app = test_app(vec![]);
        let id = app
            .state
            .store
            .unit_of_work(|uow| {
                let c = uow.create_conversation(NewConversation {
                    app_code: "health-bot",
                    platform_conversation_id: Some("dify-1"),
                    user_id: 7,
                })?;
                uow.insert_message(NewMessage {
                    conversation_id: c.id,
                    role: Role::User,
                    content: "hi",
                    usage: None,
                })?;
                uow.insert_message(NewMessage {
                    conversation_id: c.id,
                    role: Role::Assistant,
                    content: "hello",
                    usage: Some(TokenUsage {
                        prompt: 5,
                        completion: 2,
                    }),
                })?;
                Ok(c.id)
            })
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(get("/api/conversations?appCode=health-bot", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["id"], id);
        assert_eq!(json["items"][0]["title"], "Conversation with health-bot");

        let response = app
            .router
            .clone()
            .oneshot(get(&format!("/api/conversations/{}", id), "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][1]["totalTokens"], 7);

        let response = app
            .router
            .oneshot(get(&format!("/api/conversations/{}", id), "8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_requires_app_code() {
        let app = test_app(vec![]);
        let response = app
            .router
            .oneshot(get("/api/conversations", "7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_huge_page_rejected() {
        let app = test_app(vec![]);
        let response = app
            .router
            .oneshot(get(
                &format!("/api/conversations?appCode=health-bot&page={}", usize::MAX),
                "7",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_user_header_rejected() {
        let app = test_app(vec![]);
        let response = app
            .router
            .oneshot(get("/api/conversations?appCode=health-bot", "abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
