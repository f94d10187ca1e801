//! One websocket per open page. Each socket owns a [`Reconciler`] and streams
//! its updates, plus the rows behind anything new in the focused surface.

use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    appresult::{AppError, AppResult},
    db,
    reconciler::{Focus, Phase, Reconciler, Update},
    tracker::ContentKind,
    viewer::Viewer,
    views::{
        media::MediaView,
        messages::{self, MessageView},
    },
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Focus { organization_id: Uuid, kind: ContentKind },
    Blur,
    Send { content: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    State { phase: Phase, viewer: Viewer, focus: Option<Focus> },
    Message { message: MessageView },
    Media { item: MediaView },
    Error { error: String },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Update(Update),
    Frame(ServerFrame),
}

#[debug_handler(state = AppState)]
pub(crate) async fn live(
    State(state): State<AppState>,
    viewer: Viewer,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let organizations: Vec<Uuid> = viewer
        .organizations(&state.db_pool)
        .await?
        .into_iter()
        .map(|org| org.id)
        .collect();
    Ok(ws.on_upgrade(move |socket| run(state, viewer, organizations, socket)))
}

async fn run(state: AppState, viewer: Viewer, organizations: Vec<Uuid>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut reconciler = Reconciler::new(state.tracker.clone(), viewer, organizations);
    tracing::debug!(user_id = %viewer.user_id(), "live view opened");

    let mut outgoing = expand(&state, reconciler.mount(&state.feed).await).await;
    outgoing.insert(0, Outgoing::Frame(state_frame(&reconciler)));

    loop {
        if send_all(&mut sender, outgoing).await.is_err() {
            break;
        }
        outgoing = tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => client_frame(&state, &mut reconciler, frame).await,
                    Err(err) => vec![Outgoing::Frame(ServerFrame::Error { error: err.to_string() })],
                },
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => Vec::new(),
            },
            delivery = reconciler.recv() => match delivery {
                Some(delivery) => {
                    let updates = reconciler.deliver(delivery).await;
                    expand(&state, updates).await
                }
                None => break,
            },
        };
    }

    reconciler.unmount();
    tracing::debug!(user_id = %viewer.user_id(), "live view closed");
}

async fn client_frame(state: &AppState, reconciler: &mut Reconciler, frame: ClientFrame) -> Vec<Outgoing> {
    let result = match frame {
        ClientFrame::Focus { organization_id, kind } => {
            match reconciler.viewer().ensure_access(&state.db_pool, organization_id).await {
                Ok(()) => {
                    // may have been joined or created since the socket opened
                    let mut updates = reconciler.include(organization_id).await;
                    updates.extend(reconciler.set_focus(Focus { organization_id, kind }).await);
                    let mut outgoing = vec![Outgoing::Frame(state_frame(reconciler))];
                    outgoing.extend(expand(state, updates).await);
                    Ok(outgoing)
                }
                Err(err) => Err(err),
            }
        }
        ClientFrame::Blur => {
            reconciler.blur();
            Ok(vec![Outgoing::Frame(state_frame(reconciler))])
        }
        ClientFrame::Send { content } => send(state, reconciler, &content).await,
    };
    result.unwrap_or_else(|err| vec![Outgoing::Frame(error_frame(err))])
}

async fn send(state: &AppState, reconciler: &mut Reconciler, content: &str) -> AppResult<Vec<Outgoing>> {
    let Some(Focus { organization_id, kind: ContentKind::Messages }) = reconciler.focus() else {
        return Ok(vec![Outgoing::Frame(ServerFrame::Error { error: "open a chat first".to_owned() })]);
    };
    let viewer = reconciler.viewer();
    messages::send_message(&state.db_pool, &state.feed, organization_id, viewer.user_id(), content).await?;
    Ok(expand(state, reconciler.after_own_write().await).await)
}

/// Attaches the row behind each `Seen` so the open surface can append it.
async fn expand(state: &AppState, updates: Vec<Update>) -> Vec<Outgoing> {
    let mut outgoing = Vec::with_capacity(updates.len());
    for update in updates {
        if let Update::Seen { kind, row_id: Some(id), .. } = update {
            match row(state, kind, id).await {
                Ok(Some(frame)) => outgoing.push(Outgoing::Frame(frame)),
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, %id, "could not load seen row"),
            }
        }
        outgoing.push(Outgoing::Update(update));
    }
    outgoing
}

async fn row(state: &AppState, kind: ContentKind, id: Uuid) -> sqlx::Result<Option<ServerFrame>> {
    Ok(match kind {
        ContentKind::Messages => messages::message_view(&state.db_pool, id)
            .await?
            .map(|message| ServerFrame::Message { message }),
        ContentKind::Media => db::media_item(&state.db_pool, id)
            .await?
            .map(|item| ServerFrame::Media { item: MediaView::new(&state.bucket, item) }),
    })
}

fn state_frame(reconciler: &Reconciler) -> ServerFrame {
    ServerFrame::State {
        phase: reconciler.phase(),
        viewer: reconciler.viewer(),
        focus: reconciler.focus(),
    }
}

fn error_frame(err: AppError) -> ServerFrame {
    let error = match err.portal() {
        Some(portal) => portal.to_string(),
        None => {
            tracing::error!(err = %err.0, "live view request failed");
            "internal error".to_owned()
        }
    };
    ServerFrame::Error { error }
}

async fn send_all(sender: &mut SplitSink<WebSocket, WsMessage>, outgoing: Vec<Outgoing>) -> Result<(), axum::Error> {
    for frame in outgoing {
        match serde_json::to_string(&frame) {
            Ok(json) => sender.send(WsMessage::Text(json.into())).await?,
            Err(err) => tracing::error!(%err, "could not encode frame"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::Clients,
        config::Config,
        db::{testing, MemberRole, Role},
        orgs,
    };

    struct World {
        _dir: tempfile::TempDir,
        state: AppState,
        admin: Viewer,
        customer: Viewer,
        acme: Uuid,
        globex: Uuid,
    }

    async fn world() -> World {
        let db_pool = testing::pool().await;
        let dir = tempfile::tempdir().unwrap();
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;
        let casey = testing::profile(&db_pool, "Casey", Role::Customer).await;
        let acme = testing::organization(&db_pool, "Acme").await.id;
        let globex = testing::organization(&db_pool, "Globex").await.id;
        orgs::add_member(&db_pool, acme, casey.id, MemberRole::Owner).await.unwrap();
        let config = Config { media_dir: dir.path().to_owned(), ..Config::default() };
        World {
            state: AppState::new(db_pool, config, Clients::default()),
            _dir: dir,
            admin: Viewer::from_profile(&ada),
            customer: Viewer::from_profile(&casey),
            acme,
            globex,
        }
    }

    impl World {
        async fn mounted(&self, viewer: Viewer, organizations: Vec<Uuid>) -> Reconciler {
            let mut reconciler = Reconciler::new(self.state.tracker.clone(), viewer, organizations);
            reconciler.mount(&self.state.feed).await;
            reconciler
        }
    }

    fn focus(organization_id: Uuid) -> ClientFrame {
        ClientFrame::Focus { organization_id, kind: ContentKind::Messages }
    }

    fn send_frame(content: &str) -> ClientFrame {
        ClientFrame::Send { content: content.to_owned() }
    }

    fn error_of(outgoing: &[Outgoing]) -> Option<&str> {
        outgoing.iter().find_map(|frame| match frame {
            Outgoing::Frame(ServerFrame::Error { error }) => Some(error.as_str()),
            _ => None,
        })
    }

    fn messages_in(outgoing: &[Outgoing]) -> Vec<&str> {
        outgoing
            .iter()
            .filter_map(|frame| match frame {
                Outgoing::Frame(ServerFrame::Message { message }) => Some(message.content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sending_needs_an_open_chat() {
        let w = world().await;
        let mut reconciler = w.mounted(w.customer, vec![w.acme]).await;

        let outgoing = client_frame(&w.state, &mut reconciler, send_frame("hello")).await;
        assert_eq!(error_of(&outgoing), Some("open a chat first"));
    }

    #[tokio::test]
    async fn focus_send_and_seen() {
        let w = world().await;
        let mut customer = w.mounted(w.customer, vec![w.acme]).await;
        let mut admin = w.mounted(w.admin, vec![w.acme, w.globex]).await;

        let outgoing = client_frame(&w.state, &mut customer, focus(w.acme)).await;
        assert!(matches!(
            &outgoing[0],
            Outgoing::Frame(ServerFrame::State { phase: Phase::Live, focus: Some(f), .. }) if f.organization_id == w.acme
        ));

        let outgoing = client_frame(&w.state, &mut customer, send_frame("  proofs look great  ")).await;
        assert_eq!(error_of(&outgoing), None);
        let echoed = expand(&w.state, customer.drain().await).await;
        assert_eq!(messages_in(&echoed), ["proofs look great"]);
        assert!(echoed.iter().any(|frame| matches!(frame, Outgoing::Update(Update::Seen { .. }))));

        assert!(!w.state.tracker.has_unread(w.acme, w.customer, ContentKind::Messages).await.unwrap());
        assert!(w.state.tracker.has_unread(w.acme, w.admin, ContentKind::Messages).await.unwrap());
        let alerted = admin.drain().await;
        assert!(alerted.iter().any(|u| matches!(u, Update::Notification(n) if n.description == "proofs look great")));
    }

    #[tokio::test]
    async fn focusing_a_foreign_organization_is_refused() {
        let w = world().await;
        let mut customer = w.mounted(w.customer, vec![w.acme]).await;

        let outgoing = client_frame(&w.state, &mut customer, focus(w.globex)).await;
        assert_eq!(error_of(&outgoing), Some("not allowed: not a member of this organization"));
        assert_eq!(customer.focus(), None);
    }

    #[tokio::test]
    async fn chat_joined_after_connect_streams_new_messages() {
        let w = world().await;
        let mut customer = w.mounted(w.customer, vec![w.acme]).await;
        orgs::add_member(&w.state.db_pool, w.globex, w.customer.user_id(), MemberRole::Member)
            .await
            .unwrap();

        let outgoing = client_frame(&w.state, &mut customer, focus(w.globex)).await;
        assert_eq!(error_of(&outgoing), None);
        customer.drain().await;

        messages::send_message(&w.state.db_pool, &w.state.feed, w.globex, w.admin.user_id(), "welcome")
            .await
            .unwrap();
        let streamed = expand(&w.state, customer.drain().await).await;
        assert_eq!(messages_in(&streamed), ["welcome"]);
    }

    #[test]
    fn client_frames_parse() {
        let org = Uuid::now_v7();
        let focus: ClientFrame =
            serde_json::from_str(&format!(r#"{{"type":"focus","organization_id":"{org}","kind":"media"}}"#)).unwrap();
        assert!(matches!(focus, ClientFrame::Focus { organization_id, kind: ContentKind::Media } if organization_id == org));
        assert!(matches!(serde_json::from_str::<ClientFrame>(r#"{"type":"blur"}"#).unwrap(), ClientFrame::Blur));
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shout"}"#).is_err());
    }

    #[test]
    fn updates_keep_their_own_tag() {
        let org = Uuid::now_v7();
        let json = serde_json::to_value(Outgoing::Update(Update::Unread {
            organization_id: org,
            kind: ContentKind::Messages,
            unread: true,
        }))
        .unwrap();
        assert_eq!(json["type"], "unread");
        assert_eq!(json["kind"], "messages");

        let json = serde_json::to_value(Outgoing::Frame(ServerFrame::Error { error: "nope".to_owned() })).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "error", "error": "nope" }));
    }
}
