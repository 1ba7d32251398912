//! The session registry.
//!
//! Keyed by the session cookie. Each sid gets its own tree from the app
//! source, unless the app opted into shared mode, in which case every
//! session holds a handle to the same tree and sees the same state.
//!
//! The registry also owns the idle policy: when a session loses its last
//! transport, a grace timer starts, and if no session in the whole
//! registry regains a transport before it fires, shutdown is requested.
//! The grace window absorbs page reloads, where the old socket drops a
//! moment before the new one connects.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::shutdown::Shutdown;
use crate::tree::Tree;

use super::Session;

/// Where a new session's tree comes from.
#[derive(Clone)]
pub enum AppSource {
    /// Each session gets a fresh tree.
    Factory(Arc<dyn Fn() -> Tree + Send + Sync>),
    /// Every session shares one tree.
    Shared(Tree),
}

impl AppSource {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> Tree + Send + Sync + 'static,
    {
        AppSource::Factory(Arc::new(f))
    }

    fn tree(&self) -> Tree {
        match self {
            AppSource::Factory(f) => f(),
            AppSource::Shared(tree) => tree.clone(),
        }
    }
}

type SessionHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Registry policy, derived from the server configuration.
#[derive(Clone)]
pub struct RegistryConfig {
    pub title: String,
    pub debug: bool,
    /// Request shutdown once every session is transportless.
    pub exit_on_idle: bool,
    /// How long a transportless interval must last before it counts.
    pub grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            title: "Trellis".to_string(),
            debug: false,
            exit_on_idle: false,
            grace: Duration::from_millis(500),
        }
    }
}

/// All live sessions of one server.
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
    source: AppSource,
    on_session: Option<SessionHook>,
    config: RegistryConfig,
    shutdown: Shutdown,
}

impl Registry {
    pub fn new(source: AppSource, config: RegistryConfig, shutdown: Shutdown) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            source,
            on_session: None,
            config,
            shutdown,
        })
    }

    /// As [`Registry::new`], with a hook run once per created session,
    /// before its first render.
    pub fn with_hook<F>(
        source: AppSource,
        config: RegistryConfig,
        shutdown: Shutdown,
        hook: F,
    ) -> Arc<Self>
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            sessions: DashMap::new(),
            source,
            on_session: Some(Arc::new(hook)),
            config,
            shutdown,
        })
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|entry| Arc::clone(&entry))
    }

    /// Look up the session for a sid, creating it on first sight.
    pub fn get_or_create(self: &Arc<Self>, sid: &str) -> Arc<Session> {
        if let Some(session) = self.get(sid) {
            return session;
        }
        // Racing requests for the same fresh sid both reach the entry;
        // only the one that actually inserts logs and runs the hook.
        match self.sessions.entry(sid.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(
                    sid.to_string(),
                    self.source.tree(),
                    self.config.title.clone(),
                    self.config.debug,
                    Arc::downgrade(self),
                ));
                // Release the shard before user code runs.
                drop(entry.insert(Arc::clone(&session)));

                info!(sid, "session created");
                if let Some(hook) = &self.on_session {
                    hook(&session);
                }
                session
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn any_active(&self) -> bool {
        self.sessions.iter().any(|s| s.transport_count() > 0)
    }

    /// A session just lost its last transport. Under the exit-on-idle
    /// policy, start the grace timer; shutdown is requested only if the
    /// whole registry is still transportless when it fires.
    pub(crate) fn maybe_idle(self: &Arc<Self>) {
        if !self.config.exit_on_idle || self.shutdown.requested() {
            return;
        }
        debug!("all transports gone, starting idle grace timer");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(registry.config.grace).await;
            if !registry.any_active() {
                info!("idle grace expired, requesting shutdown");
                registry.shutdown.request();
            }
        });
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn factory_registry(config: RegistryConfig) -> Arc<Registry> {
        Registry::new(AppSource::factory(Tree::body), config, Shutdown::new())
    }

    #[test]
    fn sessions_are_created_once_per_sid() {
        let registry = factory_registry(RegistryConfig::default());
        let a = registry.get_or_create("s1");
        let b = registry.get_or_create("s1");
        let c = registry.get_or_create("s2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn factory_sessions_do_not_share_state() {
        let registry = factory_registry(RegistryConfig::default());
        let a = registry.get_or_create("s1");
        let b = registry.get_or_create("s2");

        a.tree().update(|doc| {
            let root = doc.root();
            let div = doc.create("div");
            doc.append_child(root, div);
        });
        // "s2" still only has its root.
        assert_eq!(b.tree().with(|doc| doc.len()), 1);
        assert_eq!(a.tree().with(|doc| doc.len()), 2);
    }

    #[test]
    fn shared_source_hands_out_one_tree() {
        let tree = Tree::body();
        let registry = Registry::new(
            AppSource::Shared(tree.clone()),
            RegistryConfig::default(),
            Shutdown::new(),
        );
        let a = registry.get_or_create("s1");
        let b = registry.get_or_create("s2");

        a.tree().update(|doc| {
            let root = doc.root();
            let div = doc.create("div");
            doc.append_child(root, div);
        });
        assert_eq!(b.tree().with(|doc| doc.len()), 2);
        assert_eq!(tree.with(|doc| doc.len()), 2);
    }

    #[test]
    fn session_hook_runs_once_per_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = Registry::with_hook(
            AppSource::factory(Tree::body),
            RegistryConfig::default(),
            Shutdown::new(),
            move |_session| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        registry.get_or_create("s1");
        registry.get_or_create("s1");
        registry.get_or_create("s2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn racing_creates_fire_the_hook_once() {
        use std::sync::Barrier;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = Registry::with_hook(
            AppSource::factory(Tree::body),
            RegistryConfig::default(),
            Shutdown::new(),
            move |_session| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        for round in 0..200 {
            let sid = format!("s{round}");
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    let barrier = Arc::clone(&barrier);
                    let sid = sid.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry.get_or_create(&sid)
                    })
                })
                .collect();
            let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(Arc::ptr_eq(&sessions[0], &sessions[1]));
            assert_eq!(calls.load(Ordering::SeqCst), round + 1);
        }
    }

    #[tokio::test]
    async fn idle_grace_requests_shutdown() {
        let registry = factory_registry(RegistryConfig {
            exit_on_idle: true,
            grace: Duration::from_millis(10),
            ..RegistryConfig::default()
        });
        let session = registry.get_or_create("s1");
        let (transport, _rx) = Transport::channel(TransportKind::Primary);
        let id = transport.id();
        session.attach(transport);

        session.detach(id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.shutdown().requested());
    }

    #[tokio::test]
    async fn reconnect_within_grace_cancels_shutdown() {
        let registry = factory_registry(RegistryConfig {
            exit_on_idle: true,
            grace: Duration::from_millis(50),
            ..RegistryConfig::default()
        });
        let session = registry.get_or_create("s1");
        let (transport, _rx) = Transport::channel(TransportKind::Primary);
        let id = transport.id();
        session.attach(transport);
        session.detach(id);

        // Reload: a new transport arrives before the grace expires.
        let (transport, _rx2) = Transport::channel(TransportKind::Primary);
        session.attach(transport);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.shutdown().requested());
    }

    #[tokio::test]
    async fn sibling_session_keeps_the_server_alive() {
        let registry = factory_registry(RegistryConfig {
            exit_on_idle: true,
            grace: Duration::from_millis(10),
            ..RegistryConfig::default()
        });
        let a = registry.get_or_create("s1");
        let b = registry.get_or_create("s2");
        let (ta, _rxa) = Transport::channel(TransportKind::Primary);
        let (tb, _rxb) = Transport::channel(TransportKind::Primary);
        let ta_id = ta.id();
        a.attach(ta);
        b.attach(tb);

        a.detach(ta_id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.shutdown().requested());
    }
}
