//! Test utilities shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use okean_backend_lib::{
    config::{PresenceScope, Settings, UserSeed},
    directory::{IdentityResolver, RelationshipStore, StaticDirectory},
    error::AppError,
    relay::{ConnectionContext, RelayOptions, SignalingRelay},
    storage::FlatFileStorage,
    AppState,
};
use okean_common::{ClientMessage, ServerMessage, UserId, UserSummary};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Users every test environment knows: `<id>-token` resolves to `<id>`
pub const USERS: [&str; 4] = ["ana", "ben", "cleo", "dan"];

/// Settings seeded with the test users. Ana, Ben and Cleo are all friends
/// with each other; Dan is friends with nobody.
pub fn test_settings(data_dir: &std::path::Path) -> Settings {
    Settings {
        data_dir: data_dir.to_path_buf(),
        users: USERS
            .iter()
            .map(|id| UserSeed {
                token: format!("{id}-token"),
                id: id.to_string(),
                display_name: capitalize(id),
                avatar_ref: None,
            })
            .collect(),
        friendships: vec![
            ("ana".to_string(), "ben".to_string()),
            ("ana".to_string(), "cleo".to_string()),
            ("ben".to_string(), "cleo".to_string()),
        ],
        ..Settings::default()
    }
}

pub fn user(id: &str) -> UserSummary {
    UserSummary::new(id, capitalize(id))
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Holds the next caller of a collaborator method until released
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Stop the next call; later calls pass straight through
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a call is parked at the gate
    pub async fn entered(&self) {
        tokio::time::timeout(Duration::from_secs(2), self.entered.notified())
            .await
            .expect("nothing reached the gate");
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
        }
    }
}

/// The static directory with gates in front of the lookups the relay
/// awaits mid-operation
pub struct GatedDirectory {
    inner: Arc<StaticDirectory>,
    pub profile: Gate,
    pub friends_of: Gate,
}

#[async_trait]
impl IdentityResolver for GatedDirectory {
    async fn resolve(&self, token: &str) -> Result<Option<UserSummary>, AppError> {
        self.inner.resolve(token).await
    }

    async fn profile(&self, user_id: &str) -> Result<Option<UserSummary>, AppError> {
        self.profile.pass().await;
        self.inner.profile(user_id).await
    }
}

#[async_trait]
impl RelationshipStore for GatedDirectory {
    async fn are_friends(&self, a: &str, b: &str) -> Result<bool, AppError> {
        self.inner.are_friends(a, b).await
    }

    async fn friends_of(&self, user_id: &str) -> Result<HashSet<UserId>, AppError> {
        self.friends_of.pass().await;
        self.inner.friends_of(user_id).await
    }
}

/// A relay over the built-in directory and a temp-dir message store
pub struct TestEnv {
    pub relay: Arc<SignalingRelay>,
    pub directory: Arc<StaticDirectory>,
    pub gates: Arc<GatedDirectory>,
    pub storage: Arc<FlatFileStorage>,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    /// Ring timeout is short so expiry can be observed in tests
    pub fn with_options(configure: impl FnOnce(&mut RelayOptions)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let settings = test_settings(temp_dir.path());
        let directory = Arc::new(StaticDirectory::from_settings(&settings));
        let storage = Arc::new(FlatFileStorage::new(temp_dir.path()).unwrap());

        let mut options = RelayOptions {
            ring_timeout: Duration::from_millis(300),
            require_friendship: true,
            presence_scope: PresenceScope::Friends,
        };
        configure(&mut options);

        let gates = Arc::new(GatedDirectory {
            inner: directory.clone(),
            profile: Gate::new(),
            friends_of: Gate::new(),
        });
        let relay = SignalingRelay::new(gates.clone(), gates.clone(), storage.clone(), options);
        Self {
            relay: Arc::new(relay),
            directory,
            gates,
            storage,
            _temp_dir: temp_dir,
        }
    }

    /// Connect a user and swallow the `Connected` and `UnreadMessageCount`
    /// greeting
    pub async fn connect(&self, id: &str) -> Client {
        self.connect_to_groups(id, &[]).await
    }

    pub async fn connect_to_groups(&self, id: &str, groups: &[&str]) -> Client {
        Client::open(self.relay.clone(), id, groups).await
    }
}

/// One simulated connection
pub struct Client {
    relay: Arc<SignalingRelay>,
    pub ctx: ConnectionContext,
    rx: mpsc::Receiver<ServerMessage>,
    /// Unread private messages reported on connect
    pub unread: u64,
}

impl Client {
    /// Register a connection on `relay` and consume its greeting
    pub async fn open(relay: Arc<SignalingRelay>, id: &str, groups: &[&str]) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let ctx = relay.connect(user(id), tx, &groups).await.unwrap();
        let mut client = Client {
            relay,
            ctx,
            rx,
            unread: 0,
        };

        let greeting = client.recv().await;
        assert!(matches!(greeting, ServerMessage::Connected { .. }), "got {greeting:?}");
        // Group joins of this connection are not echoed back to it
        let ServerMessage::UnreadMessageCount { count } = client.recv().await else {
            panic!("expected UnreadMessageCount after Connected");
        };
        client.unread = count;
        client
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), AppError> {
        self.relay.handle(&self.ctx, message).await
    }

    /// Next event, failing the test after two seconds
    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbound queue closed")
    }

    /// Assert nothing is queued for this connection
    pub fn assert_silent(&mut self) {
        if let Ok(event) = self.rx.try_recv() {
            panic!("unexpected event for {}: {event:?}", self.ctx.user.id);
        }
    }

    /// Throw away everything queued so far
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub async fn disconnect(self) {
        self.relay.disconnect(&self.ctx).await;
    }

    pub fn connection_id(&self) -> uuid::Uuid {
        self.ctx.connection_id
    }
}

/// Full application state for router level tests
pub fn app_state(temp_dir: &TempDir) -> Arc<AppState> {
    Arc::new(AppState::new(test_settings(temp_dir.path())).unwrap())
}
