//! `PeerChatSystem`: presence, message history and the permission gate,
//! kept consistent across instances through a shared bus and store.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bus::BroadcastBus;
use crate::config::ChatConfig;
use crate::error::{Error, Result, StorageError};
use crate::event::BusEvent;
use crate::heartbeat::Heartbeat;
use crate::store::{self, KeyValueStore};
use crate::types::{
    ADMIN, BROADCAST_RECIPIENT, Message, PendingPermissionRequest, PersistedState, User,
    UserProfile, is_implicitly_trusted, now_millis, request_id,
};

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Consumer-supplied event callbacks.
#[derive(Default)]
struct Handlers {
    new_message: Option<Callback<Message>>,
    users_update: Option<Callback<Vec<User>>>,
    permission_request: Option<Callback<PendingPermissionRequest>>,
    permission_granted: Option<Callback<String>>,
}

/// A callback invocation produced by applying an event.
#[derive(Debug)]
enum Notification {
    NewMessage(Message),
    UsersUpdate(Vec<User>),
    PermissionRequest(PendingPermissionRequest),
    PermissionGranted(String),
}

/// Result of [`PeerChatSystem::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Appended to history and published. `persisted` is false when the
    /// storage write failed; the message was still accepted.
    Sent { message: Message, persisted: bool },
    /// Withheld until the recipient grants permission. The caller must resend.
    PermissionRequested { request_id: String },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, SendOutcome::Sent { persisted: true, .. })
    }
}

#[derive(Default)]
struct ChatState {
    local_user: Option<UserProfile>,
    users: BTreeMap<String, User>,
    messages: Vec<Message>,
    message_ids: HashSet<String>,
    allowed_contacts: BTreeSet<String>,
    /// Requests addressed to the local user, by request id.
    pending_requests: BTreeMap<String, PendingPermissionRequest>,
}

impl ChatState {
    fn from_persisted(persisted: PersistedState) -> Self {
        let message_ids = persisted
            .message_history
            .iter()
            .map(|m| m.id.clone())
            .collect();
        Self {
            messages: persisted.message_history,
            message_ids,
            allowed_contacts: persisted.allowed_contacts.into_iter().collect(),
            ..Self::default()
        }
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            message_history: self.messages.clone(),
            allowed_contacts: self.allowed_contacts.iter().cloned().collect(),
        }
    }

    fn local_name(&self) -> Option<&str> {
        self.local_user.as_ref().map(|u| u.name.as_str())
    }

    fn is_local(&self, name: &str) -> bool {
        self.local_name() == Some(name)
    }

    /// The permission gate: may `name` exchange direct messages with us.
    fn accepts_direct(&self, name: &str) -> bool {
        is_implicitly_trusted(name) || self.allowed_contacts.contains(name)
    }

    /// Record a request addressed to us. A newer request from the same
    /// sender replaces the older one.
    fn queue_request(&mut self, request: PendingPermissionRequest) {
        self.pending_requests.retain(|_, r| r.from != request.from);
        self.pending_requests.insert(request.request_id.clone(), request);
    }

    fn append(&mut self, message: Message) -> bool {
        if !self.message_ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<dyn BroadcastBus>,
    config: ChatConfig,
    state: Mutex<ChatState>,
    handlers: Mutex<Handlers>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: &BusEvent) {
        if let Err(e) = self.bus.publish(event) {
            error!("Failed to publish {}: {e}", event.kind());
        }
    }

    fn persist(&self, state: &ChatState) -> std::result::Result<(), StorageError> {
        store::save_state(self.store.as_ref(), &self.config.storage_key, &state.snapshot())
    }

    /// Persist, logging instead of failing. Returns whether the write landed.
    fn persist_logged(&self, state: &ChatState) -> bool {
        match self.persist(state) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist chat state: {e}");
                false
            }
        }
    }

    fn roster(&self, state: &ChatState, now: u64) -> Vec<User> {
        let window = self.config.freshness_window_ms();
        let mut online: Vec<User> = state
            .users
            .values()
            .filter(|u| u.is_fresh(now, window))
            .cloned()
            .collect();

        if !online.iter().any(|u| u.name == ADMIN) {
            online.push(User::from_profile(&self.config.admin, now));
        }
        online
    }

    fn dispatch(&self, event: BusEvent) {
        if let Some(notification) = self.apply(event) {
            self.notify(notification);
        }
    }

    /// Interpret one bus event against local state.
    fn apply(&self, event: BusEvent) -> Option<Notification> {
        let mut state = self.state();
        match event {
            BusEvent::UserJoined { user, timestamp } => {
                trace!("{} joined at {timestamp}", user.name);
                state
                    .users
                    .insert(user.name.clone(), User::from_profile(&user, timestamp));
                Some(Notification::UsersUpdate(self.roster(&state, now_millis())))
            }

            BusEvent::NewMessage { message } => {
                let to_us = state.is_local(&message.to);
                if !(message.is_broadcast() || to_us || state.is_local(&message.from)) {
                    return None;
                }

                if to_us && !state.accepts_direct(&message.from) {
                    let request = PendingPermissionRequest {
                        from: message.from,
                        to: message.to,
                        message: message.text,
                        request_id: request_id(),
                    };
                    info!("Withholding direct message from {}", request.from);
                    state.queue_request(request.clone());
                    return Some(Notification::PermissionRequest(request));
                }

                if !state.append(message.clone()) {
                    trace!("Message {} already in history", message.id);
                    return None;
                }
                self.persist_logged(&state);
                Some(Notification::NewMessage(message))
            }

            BusEvent::PermissionRequest {
                from,
                to,
                message,
                request_id,
            } => {
                if !state.is_local(&to) {
                    return None;
                }
                let request = PendingPermissionRequest {
                    from,
                    to,
                    message,
                    request_id,
                };
                state.queue_request(request.clone());
                Some(Notification::PermissionRequest(request))
            }

            BusEvent::PermissionResponse {
                from,
                to,
                granted,
                request_id,
            } => {
                if !state.is_local(&to) {
                    return None;
                }
                if !granted {
                    debug!("{from} declined permission request {request_id}");
                    return None;
                }
                state.allowed_contacts.insert(from.clone());
                self.persist_logged(&state);
                info!("{from} granted permission ({request_id})");
                Some(Notification::PermissionGranted(from))
            }

            BusEvent::Heartbeat { user, timestamp } => {
                if state.is_local(&user) {
                    return None;
                }
                match state.users.get_mut(&user) {
                    Some(record) => {
                        record.last_seen = timestamp;
                        None
                    }
                    None => {
                        // Joined before we subscribed; all we know is the name.
                        let profile = UserProfile {
                            name: user.clone(),
                            ..UserProfile::default()
                        };
                        state
                            .users
                            .insert(user, User::from_profile(&profile, timestamp));
                        Some(Notification::UsersUpdate(self.roster(&state, now_millis())))
                    }
                }
            }

            BusEvent::UserLeft { user, timestamp } => {
                debug!("{user} left at {timestamp}; presence will age out");
                None
            }
        }
    }

    /// Invoke the matching callback. No internal lock is held here.
    fn notify(&self, notification: Notification) {
        let handlers = self.handlers();
        match notification {
            Notification::NewMessage(message) => {
                let callback = handlers.new_message.clone();
                drop(handlers);
                if let Some(callback) = callback {
                    callback(message);
                }
            }
            Notification::UsersUpdate(users) => {
                let callback = handlers.users_update.clone();
                drop(handlers);
                if let Some(callback) = callback {
                    callback(users);
                }
            }
            Notification::PermissionRequest(request) => {
                let callback = handlers.permission_request.clone();
                drop(handlers);
                if let Some(callback) = callback {
                    callback(request);
                }
            }
            Notification::PermissionGranted(from) => {
                let callback = handlers.permission_granted.clone();
                drop(handlers);
                if let Some(callback) = callback {
                    callback(from);
                }
            }
        }
    }

    /// One heartbeat: refresh our own record and announce it.
    fn beat(&self) {
        let now = now_millis();
        let name = {
            let mut state = self.state();
            let Some(profile) = state.local_user.clone() else {
                return;
            };
            state
                .users
                .entry(profile.name.clone())
                .and_modify(|u| u.last_seen = now)
                .or_insert_with(|| User::from_profile(&profile, now));
            profile.name
        };
        self.publish(&BusEvent::Heartbeat {
            user: name,
            timestamp: now,
        });
    }
}

/// One instance ("tab") of the cross-instance chat layer.
pub struct PeerChatSystem {
    inner: Arc<Inner>,
    receiver: Mutex<Option<broadcast::Receiver<BusEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Heartbeat,
}

impl PeerChatSystem {
    /// Load persisted history and contacts, then subscribe to the bus.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn BroadcastBus>,
        config: ChatConfig,
    ) -> Self {
        let persisted = store::load_state(store.as_ref(), &config.storage_key);
        debug!(
            "Loaded {} messages and {} contacts from '{}'",
            persisted.message_history.len(),
            persisted.allowed_contacts.len(),
            config.storage_key
        );
        let receiver = bus.subscribe();

        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                config,
                state: Mutex::new(ChatState::from_persisted(persisted)),
                handlers: Mutex::new(Handlers::default()),
            }),
            receiver: Mutex::new(Some(receiver)),
            listener: Mutex::new(None),
            heartbeat: Heartbeat::new(),
        }
    }

    /// Register the local identity and announce it. Returns the roster.
    pub fn join(&self, name: &str, color: &str, email: &str, phone: &str) -> Vec<User> {
        let profile = UserProfile::new(name, color, email, phone);
        let now = now_millis();

        let roster = {
            let mut state = self.inner.state();
            state.local_user = Some(profile.clone());
            state
                .users
                .insert(profile.name.clone(), User::from_profile(&profile, now));
            state.allowed_contacts.insert(ADMIN.to_string());
            self.inner.roster(&state, now)
        };

        self.inner.publish(&BusEvent::UserJoined {
            user: profile,
            timestamp: now,
        });
        info!("{name} joined peer chat");
        roster
    }

    /// Send `text` to a user or to `"all"`.
    ///
    /// Direct messages to a user who has not granted permission are not
    /// delivered: a permission request goes out instead and the caller must
    /// resend after `on_permission_granted`.
    pub fn send_message(&self, to: &str, text: &str) -> Result<SendOutcome> {
        let mut state = self.inner.state();
        let from = state.local_name().ok_or(Error::NotJoined)?.to_string();

        if to != BROADCAST_RECIPIENT && !state.accepts_direct(to) {
            drop(state);
            let request_id = request_id();
            self.inner.publish(&BusEvent::PermissionRequest {
                from,
                to: to.to_string(),
                message: text.to_string(),
                request_id: request_id.clone(),
            });
            info!("Permission request sent to {to}");
            return Ok(SendOutcome::PermissionRequested { request_id });
        }

        let message = Message::new(from, to, text);
        state.append(message.clone());
        let persisted = self.inner.persist_logged(&state);
        drop(state);

        self.inner.publish(&BusEvent::NewMessage {
            message: message.clone(),
        });
        Ok(SendOutcome::Sent { message, persisted })
    }

    /// Answer a permission request from `from`. A grant is persisted and
    /// mirrored to the requester; the withheld message is not resent.
    pub fn handle_permission_response(
        &self,
        from: &str,
        granted: bool,
        request_id: &str,
    ) -> Result<()> {
        let me = {
            let mut state = self.inner.state();
            let me = state.local_name().ok_or(Error::NotJoined)?.to_string();
            state.pending_requests.remove(request_id);
            if granted && state.allowed_contacts.insert(from.to_string()) {
                self.inner.persist_logged(&state);
            }
            me
        };

        self.inner.publish(&BusEvent::PermissionResponse {
            from: me,
            to: from.to_string(),
            granted,
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    /// Users seen within the freshness window, plus Admin.
    pub fn get_online_users(&self) -> Vec<User> {
        let state = self.inner.state();
        self.inner.roster(&state, now_millis())
    }

    /// Every message this instance knows about, in arrival order.
    pub fn get_messages(&self) -> Vec<Message> {
        self.inner.state().messages.clone()
    }

    pub fn allowed_contacts(&self) -> Vec<String> {
        self.inner.state().allowed_contacts.iter().cloned().collect()
    }

    /// Whether direct messages with `name` pass the permission gate.
    pub fn is_allowed(&self, name: &str) -> bool {
        self.inner.state().accepts_direct(name)
    }

    /// Unanswered requests addressed to the local user.
    pub fn pending_requests(&self) -> Vec<PendingPermissionRequest> {
        self.inner.state().pending_requests.values().cloned().collect()
    }

    pub fn local_user(&self) -> Option<UserProfile> {
        self.inner.state().local_user.clone()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    /// Start announcing presence every heartbeat interval. Replaces any
    /// running heartbeat.
    pub fn start_heartbeat(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.heartbeat
            .start(self.inner.config.heartbeat_interval, move || inner.beat())
    }

    /// Returns whether a heartbeat was running.
    pub fn stop_heartbeat(&self) -> bool {
        self.heartbeat.stop()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Stop the heartbeat, announce departure and forget the local identity.
    pub fn leave(&self) {
        self.stop_heartbeat();
        let Some(profile) = self.inner.state().local_user.take() else {
            return;
        };
        self.inner.publish(&BusEvent::UserLeft {
            user: profile.name.clone(),
            timestamp: now_millis(),
        });
        info!("{} left peer chat", profile.name);
    }

    /// Apply one event as if it had arrived on the bus.
    pub fn handle_event(&self, event: BusEvent) {
        self.inner.dispatch(event);
    }

    /// Dispatch every event queued on our subscription. Returns how many were
    /// handled. Does nothing once [`spawn_listener`](Self::spawn_listener)
    /// owns the subscription.
    pub fn process_pending(&self) -> usize {
        let mut events = Vec::new();
        {
            let mut slot = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(rx) = slot.as_mut() else {
                return 0;
            };
            loop {
                match rx.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!("Bus subscriber lagged; {missed} events lost");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }

        let handled = events.len();
        for event in events {
            self.inner.dispatch(event);
        }
        handled
    }

    /// Move the subscription into a task that dispatches events as they
    /// arrive. Returns `false` if a listener is already running.
    pub fn spawn_listener(&self) -> Result<bool> {
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let Some(mut rx) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(false);
        };

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => inner.dispatch(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Bus listener lagged; {missed} events lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(true)
    }

    pub fn on_new_message(&self, callback: impl Fn(Message) + Send + Sync + 'static) {
        self.inner.handlers().new_message = Some(Arc::new(callback));
    }

    pub fn on_users_update(&self, callback: impl Fn(Vec<User>) + Send + Sync + 'static) {
        self.inner.handlers().users_update = Some(Arc::new(callback));
    }

    pub fn on_permission_request(
        &self,
        callback: impl Fn(PendingPermissionRequest) + Send + Sync + 'static,
    ) {
        self.inner.handlers().permission_request = Some(Arc::new(callback));
    }

    pub fn on_permission_granted(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.inner.handlers().permission_granted = Some(Arc::new(callback));
    }
}

impl Drop for PeerChatSystem {
    fn drop(&mut self) {
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> std::result::Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }

        fn set(&self, _key: &str, _value: &str) -> std::result::Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
    }

    fn tab(bus: &LocalBus, store: &MemoryStore) -> PeerChatSystem {
        PeerChatSystem::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            ChatConfig::default(),
        )
    }

    fn joined(name: &str) -> (PeerChatSystem, LocalBus) {
        let bus = LocalBus::new();
        let system = tab(&bus, &MemoryStore::new());
        system.join(name, "bg-blue-500", "", "");
        (system, bus)
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |item| sink.lock().unwrap().push(item))
    }

    #[test]
    fn direct_message_without_permission_is_withheld() {
        let (alice, bus) = joined("alice");
        let mut rx = bus.subscribe();

        let outcome = alice.send_message("bob", "hello").unwrap();
        assert!(!outcome.is_sent());
        assert!(alice.get_messages().is_empty());

        match rx.try_recv().unwrap() {
            BusEvent::PermissionRequest {
                from, to, message, ..
            } => {
                assert_eq!(from, "alice");
                assert_eq!(to, "bob");
                assert_eq!(message, "hello");
            }
            other => panic!("expected permission request, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_and_admin_messages_are_appended() {
        let (alice, _bus) = joined("alice");

        for (count, to) in ["all", "Admin"].into_iter().enumerate() {
            let outcome = alice.send_message(to, "hi").unwrap();
            assert!(outcome.is_sent());
            assert!(outcome.is_persisted());

            let messages = alice.get_messages();
            assert_eq!(messages.len(), count + 1);
            let last = messages.last().unwrap();
            assert_eq!(last.from, "alice");
            assert_eq!(last.to, to);
            assert_eq!(last.text, "hi");
        }
    }

    #[test]
    fn send_before_join_fails() {
        let system = tab(&LocalBus::new(), &MemoryStore::new());
        assert!(matches!(
            system.send_message("all", "hi"),
            Err(Error::NotJoined)
        ));
        assert!(matches!(
            system.handle_permission_response("bob", true, "req_1_x"),
            Err(Error::NotJoined)
        ));
    }

    #[test]
    fn grant_opens_the_route_back_to_requester() {
        let (bob, _bus) = joined("bob");
        assert!(!bob.send_message("alice", "hey").unwrap().is_sent());

        bob.handle_permission_response("alice", true, "req_1_abc").unwrap();
        assert!(bob.is_allowed("alice"));
        assert!(bob.send_message("alice", "hey").unwrap().is_sent());
    }

    #[test]
    fn decline_publishes_response_without_allowing() {
        let (bob, bus) = joined("bob");
        let mut rx = bus.subscribe();

        bob.handle_permission_response("alice", false, "req_1_abc").unwrap();
        assert!(!bob.is_allowed("alice"));
        assert_eq!(
            rx.try_recv().unwrap(),
            BusEvent::PermissionResponse {
                from: "bob".into(),
                to: "alice".into(),
                granted: false,
                request_id: "req_1_abc".into(),
            }
        );
    }

    #[test]
    fn response_clears_pending_request() {
        let (bob, _bus) = joined("bob");
        bob.handle_event(BusEvent::PermissionRequest {
            from: "alice".into(),
            to: "bob".into(),
            message: "hello".into(),
            request_id: "req_1_abc".into(),
        });
        assert_eq!(bob.pending_requests().len(), 1);

        bob.handle_permission_response("alice", false, "req_1_abc").unwrap();
        assert!(bob.pending_requests().is_empty());
    }

    #[test]
    fn admin_is_always_online() {
        let system = tab(&LocalBus::new(), &MemoryStore::new());
        let roster = system.get_online_users();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "Admin");
        assert_eq!(roster[0].email, "admin@kamogelomosia.com");

        // A stale Admin record still reports Admin online.
        system.handle_event(BusEvent::UserJoined {
            user: UserProfile::new("Admin", "bg-red-500", "", ""),
            timestamp: now_millis() - 60_000,
        });
        assert!(system.get_online_users().iter().any(|u| u.name == "Admin"));
    }

    #[test]
    fn stale_users_drop_out_of_the_roster() {
        let (alice, _bus) = joined("alice");
        let now = now_millis();

        alice.handle_event(BusEvent::UserJoined {
            user: UserProfile::new("carol", "bg-green-500", "carol@example.com", ""),
            timestamp: now - 31_000,
        });
        let names: Vec<String> = alice.get_online_users().into_iter().map(|u| u.name).collect();
        assert!(!names.contains(&"carol".to_string()));
        assert!(names.contains(&"alice".to_string()));

        alice.handle_event(BusEvent::Heartbeat {
            user: "carol".into(),
            timestamp: now,
        });
        let carol = alice
            .get_online_users()
            .into_iter()
            .find(|u| u.name == "carol")
            .expect("carol refreshed by heartbeat");
        assert_eq!(carol.email, "carol@example.com");
    }

    #[test]
    fn heartbeat_from_unknown_user_adds_bare_record() {
        let (alice, _bus) = joined("alice");
        let (updates, sink) = recorder();
        alice.on_users_update(sink);

        alice.handle_event(BusEvent::Heartbeat {
            user: "dave".into(),
            timestamp: now_millis(),
        });
        let roster = alice.get_online_users();
        let dave = roster.iter().find(|u| u.name == "dave").unwrap();
        assert!(dave.color.is_empty());
        assert_eq!(updates.lock().unwrap().len(), 1);
    }

    #[test]
    fn own_heartbeat_is_ignored() {
        let (alice, _bus) = joined("alice");
        let before = alice
            .get_online_users()
            .into_iter()
            .find(|u| u.name == "alice")
            .unwrap();

        alice.handle_event(BusEvent::Heartbeat {
            user: "alice".into(),
            timestamp: 1,
        });
        let after = alice
            .get_online_users()
            .into_iter()
            .find(|u| u.name == "alice")
            .unwrap();
        assert_eq!(before.last_seen, after.last_seen);
    }

    #[test]
    fn self_delivered_message_is_not_duplicated() {
        let (alice, _bus) = joined("alice");
        let (seen, sink) = recorder();
        alice.on_new_message(sink);

        alice.send_message("all", "hi").unwrap();
        assert!(alice.process_pending() >= 2);
        assert_eq!(alice.get_messages().len(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn inbound_message_from_stranger_becomes_request() {
        let (bob, _bus) = joined("bob");
        let (requests, sink) = recorder();
        bob.on_permission_request(sink);

        bob.handle_event(BusEvent::NewMessage {
            message: Message::new("mallory", "bob", "psst"),
        });
        assert!(bob.get_messages().is_empty());

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].from, "mallory");
        assert_eq!(requests[0].message, "psst");
        assert!(requests[0].request_id.starts_with("req_"));
    }

    #[test]
    fn repeated_requests_from_one_sender_keep_the_latest() {
        let (bob, _bus) = joined("bob");
        for text in ["psst", "psst again", "hello?"] {
            bob.handle_event(BusEvent::NewMessage {
                message: Message::new("mallory", "bob", text),
            });
        }
        bob.handle_event(BusEvent::PermissionRequest {
            from: "alice".into(),
            to: "bob".into(),
            message: "hi".into(),
            request_id: "req_1_alice".into(),
        });

        let pending = bob.pending_requests();
        assert_eq!(pending.len(), 2);
        let mallory = pending.iter().find(|r| r.from == "mallory").unwrap();
        assert_eq!(mallory.message, "hello?");

        bob.handle_event(BusEvent::PermissionRequest {
            from: "alice".into(),
            to: "bob".into(),
            message: "hi again".into(),
            request_id: "req_2_alice".into(),
        });
        let pending = bob.pending_requests();
        assert_eq!(pending.len(), 2);
        let alice = pending.iter().find(|r| r.from == "alice").unwrap();
        assert_eq!(alice.request_id, "req_2_alice");
    }

    #[test]
    fn inbound_message_from_admin_is_delivered() {
        let (bob, _bus) = joined("bob");
        let (seen, sink) = recorder();
        bob.on_new_message(sink);

        bob.handle_event(BusEvent::NewMessage {
            message: Message::new("Admin", "bob", "welcome"),
        });
        assert_eq!(bob.get_messages().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].text, "welcome");
    }

    #[test]
    fn messages_between_others_are_ignored() {
        let (bob, _bus) = joined("bob");
        bob.handle_event(BusEvent::NewMessage {
            message: Message::new("alice", "carol", "private"),
        });
        assert!(bob.get_messages().is_empty());
    }

    #[test]
    fn history_and_contacts_survive_reload() {
        let bus = LocalBus::new();
        let store = MemoryStore::new();

        let first = tab(&bus, &store);
        first.join("alice", "", "", "");
        first.send_message("all", "one").unwrap();
        first.handle_permission_response("bob", true, "req_1_abc").unwrap();
        first.send_message("bob", "two").unwrap();
        let saved = first.get_messages();
        drop(first);

        let reloaded = tab(&bus, &store);
        assert_eq!(reloaded.get_messages(), saved);
        let contacts = reloaded.allowed_contacts();
        assert!(contacts.contains(&"bob".to_string()));
        assert!(contacts.contains(&"Admin".to_string()));
    }

    #[test]
    fn storage_failure_still_sends() {
        let bus = LocalBus::new();
        let system = PeerChatSystem::new(
            Arc::new(FailingStore),
            Arc::new(bus.clone()),
            ChatConfig::default(),
        );
        system.join("alice", "", "", "");

        let outcome = system.send_message("all", "hi").unwrap();
        assert!(outcome.is_sent());
        assert!(!outcome.is_persisted());
        assert_eq!(system.get_messages().len(), 1);
    }

    #[test]
    fn malformed_storage_starts_empty() {
        let store = MemoryStore::new();
        store.set("peer-chat-data", "[[[").unwrap();
        let system = tab(&LocalBus::new(), &store);
        assert!(system.get_messages().is_empty());
        assert!(system.allowed_contacts().is_empty());
    }

    #[test]
    fn leave_announces_and_forgets_identity() {
        let (alice, bus) = joined("alice");
        let mut rx = bus.subscribe();

        alice.leave();
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::UserLeft { ref user, .. } if user == "alice"
        ));
        assert!(alice.local_user().is_none());
        assert!(matches!(
            alice.send_message("all", "hi"),
            Err(Error::NotJoined)
        ));
    }

    #[test]
    fn user_left_does_not_evict() {
        let (alice, _bus) = joined("alice");
        alice.handle_event(BusEvent::UserJoined {
            user: UserProfile::new("bob", "", "", ""),
            timestamp: now_millis(),
        });
        alice.handle_event(BusEvent::UserLeft {
            user: "bob".into(),
            timestamp: now_millis(),
        });
        assert!(alice.get_online_users().iter().any(|u| u.name == "bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_heartbeat_broadcasts_once_per_interval() {
        let (alice, bus) = joined("alice");
        let mut rx = bus.subscribe();

        alice.start_heartbeat().unwrap();
        alice.start_heartbeat().unwrap();
        assert!(alice.heartbeat_running());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let mut beats = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BusEvent::Heartbeat { ref user, .. } if user == "alice") {
                beats += 1;
            }
        }
        assert_eq!(beats, 1);

        assert!(alice.stop_heartbeat());
        assert!(!alice.heartbeat_running());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_stops_heartbeat() {
        let (alice, _bus) = joined("alice");
        alice.start_heartbeat().unwrap();
        alice.leave();
        assert!(!alice.heartbeat_running());
    }

    #[tokio::test]
    async fn listener_delivers_without_polling() {
        let bus = LocalBus::new();
        let store = MemoryStore::new();
        let alice = tab(&bus, &store);
        let bob = tab(&bus, &store);
        alice.join("alice", "", "", "");
        bob.join("bob", "", "", "");

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        bob.on_new_message(move |message| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(message);
            }
        });
        assert!(bob.spawn_listener().unwrap());
        assert!(!bob.spawn_listener().unwrap());
        assert_eq!(bob.process_pending(), 0);

        alice.send_message("all", "ping").unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("listener dispatched in time")
            .unwrap();
        assert_eq!(message.from, "alice");
        assert_eq!(message.text, "ping");
    }
}
