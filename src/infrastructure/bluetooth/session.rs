//! BLE control session
//!
//! Owns the link to one car. Everything that touches the radio runs inside
//! [`ConnectionSession::run`] on a single task; the rest of the program
//! talks to it through a cloneable [`SessionHandle`] and reads results off
//! the [`EventBus`] and the snapshot channel.
//!
//! ```text
//!  SessionHandle ──commands──▶ ┌──────────────────┐ ──write──▶ control char
//!                              │ ConnectionSession │
//!  EventReceiver ◀──events──── └──────────────────┘ ◀─notify── status/battery
//! ```

use crate::domain::models::{
    CommandPayload, ControlState, SessionEvent, SessionPhase, SessionSnapshot, StateChange,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::event_bus::{EventBus, ReservedSlots};
use crate::infrastructure::bluetooth::link::{GattLink, LinkConnector, LinkEvent};
use crate::infrastructure::bluetooth::protocol::{self, BleAddress, Characteristic};
use crate::infrastructure::bluetooth::rate_limiter::{RateLimiter, DEFAULT_MIN_INTERVAL};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Upper bound for each teardown step so a dead link cannot stall `stop()`.
const TEARDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub write_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(45),
            write_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            write_interval: Duration::from_millis(settings.write_interval_ms),
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Change(StateChange),
    RequestBattery,
}

/// Cheap, cloneable front door to a running session.
///
/// Every method is non-blocking. Once the session has reached
/// `Disconnected` the command methods silently do nothing.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn submit_state_change(&self, change: StateChange) {
        if change.is_empty() {
            return;
        }
        let _ = self.commands.send(SessionCommand::Change(change));
    }

    pub fn request_battery(&self) {
        let _ = self.commands.send(SessionCommand::RequestBattery);
    }

    /// Ask the session to disconnect. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.snapshot.borrow().phase
    }

    /// Resolves once the session reports `phase`, or with `None` if the
    /// session is gone without ever reaching it.
    pub async fn wait_for_phase(&self, phase: SessionPhase) -> Option<SessionSnapshot> {
        let mut receiver = self.snapshot.clone();
        let snapshot = match receiver.wait_for(|snapshot| snapshot.phase == phase).await {
            Ok(snapshot) => Some(snapshot.clone()),
            Err(_) => None,
        };
        snapshot
    }
}

/// Why the connected phase ended.
#[derive(Debug)]
enum Exit {
    Stopped,
    LinkLost(String),
}

pub struct ConnectionSession<C: LinkConnector> {
    connector: C,
    address: BleAddress,
    core: SessionCore,
}

impl<C: LinkConnector> ConnectionSession<C> {
    pub fn new(
        connector: C,
        address: BleAddress,
        config: SessionConfig,
        bus: EventBus,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let cancel = CancellationToken::new();

        let core = SessionCore {
            connect_timeout: config.connect_timeout,
            closing: bus.reserve(2),
            bus,
            commands: command_rx,
            commands_open: true,
            cancel: cancel.clone(),
            snapshot: snapshot_tx,
            phase: SessionPhase::Idle,
            state: ControlState::default(),
            limiter: RateLimiter::new(config.write_interval),
            status_notify: false,
            battery_notify: false,
            deferred: None,
            // An empty first notification counts as a repeat.
            last_status_raw: Some(Vec::new()),
            last_battery: None,
        };
        let handle = SessionHandle {
            commands: command_tx,
            cancel,
            snapshot: snapshot_rx,
        };

        (
            Self {
                connector,
                address,
                core,
            },
            handle,
        )
    }

    /// Connect, serve commands and notifications until stopped or the link
    /// drops, then tear down. Always ends in `Disconnected` with exactly one
    /// `Disconnected` event followed by the shutdown sentinel.
    pub async fn run(self) {
        let Self {
            connector,
            address,
            mut core,
        } = self;

        if core.cancel.is_cancelled() {
            info!("Session for {} stopped before connecting", address);
        } else {
            info!("Connecting to car at {}", address);
            core.set_phase(SessionPhase::Connecting);
            core.bus.message(format!("Connecting to {}...", address));

            let (link_tx, mut link_rx) = mpsc::unbounded_channel();
            if let Some(mut link) = core.open_link(&connector, address, link_tx).await {
                // The link is released on every way out of the connected phase.
                let exit = core.drive(&mut link, &mut link_rx).await;
                core.teardown(&mut link, exit).await;
            }
        }

        core.set_phase(SessionPhase::Disconnected);
        core.closing.post(SessionEvent::Disconnected);
        core.closing.post(SessionEvent::Shutdown);
        let dropped = core.bus.dropped();
        if dropped > 0 {
            debug!("{} event(s) dropped on a full bus", dropped);
        }
        info!("Session for {} finished", address);
    }
}

struct SessionCore {
    connect_timeout: Duration,
    bus: EventBus,
    /// Held back for the closing `Disconnected` and `Shutdown` events.
    closing: ReservedSlots,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    commands_open: bool,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    phase: SessionPhase,
    state: ControlState,
    limiter: RateLimiter,
    status_notify: bool,
    battery_notify: bool,
    /// Payload built while still connecting, written right after setup.
    deferred: Option<CommandPayload>,
    last_status_raw: Option<Vec<u8>>,
    last_battery: Option<u8>,
}

impl SessionCore {
    async fn open_link<C: LinkConnector>(
        &mut self,
        connector: &C,
        address: BleAddress,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Option<C::Link> {
        let cancel = self.cancel.clone();
        let connect = tokio::time::timeout(self.connect_timeout, connector.connect(address, events));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                biased;
                result = &mut connect => {
                    return match result {
                        Ok(Ok(link)) => {
                            info!("Link to {} established", address);
                            Some(link)
                        }
                        Ok(Err(e)) => {
                            error!("Connection to {} failed: {}", address, e);
                            self.bus.error(format!("Connection error: {}", e));
                            None
                        }
                        Err(_) => {
                            error!("Connection to {} timed out", address);
                            self.bus.error(format!(
                                "Connection error: timed out after {}s",
                                self.connect_timeout.as_secs()
                            ));
                            None
                        }
                    };
                }
                command = self.commands.recv(), if self.commands_open => {
                    match command {
                        Some(command) => self.queue_while_connecting(command),
                        None => {
                            debug!("All session handles dropped while connecting");
                            self.commands_open = false;
                            return None;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Connect to {} cancelled", address);
                    return None;
                }
            }
        }
    }

    fn queue_while_connecting(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Change(change) => {
                self.state.apply(&change);
                self.deferred = Some(protocol::encode(&self.state));
                self.publish();
            }
            SessionCommand::RequestBattery => {
                self.bus
                    .message("Battery read queued; waiting for connection");
            }
        }
    }

    async fn drive<L: GattLink>(
        &mut self,
        link: &mut L,
        link_events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Exit {
        self.set_phase(SessionPhase::Connected);
        self.bus.post(SessionEvent::Connected);

        if let Err(exit) = self.setup(link).await {
            return exit;
        }

        let cancel = self.cancel.clone();
        loop {
            // Queued commands go out before a pending stop is honoured.
            let step = tokio::select! {
                biased;
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(SessionCommand::Change(change)) => self.submit(link, change).await,
                    Some(SessionCommand::RequestBattery) => self.read_battery(link, false).await,
                    None => {
                        debug!("All session handles dropped, stopping");
                        self.commands_open = false;
                        Err(Exit::Stopped)
                    }
                },
                event = link_events.recv() => match event {
                    Some(LinkEvent::Notification { characteristic, data }) => {
                        self.on_notification(characteristic, &data);
                        Ok(())
                    }
                    Some(LinkEvent::Dropped) | None => Err(Exit::LinkLost("device disconnected".to_string())),
                },
                _ = cancel.cancelled() => Err(Exit::Stopped),
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn setup<L: GattLink>(&mut self, link: &mut L) -> Result<(), Exit> {
        self.status_notify = self.enable_notify(link, Characteristic::Status).await?;
        self.battery_notify = self.enable_notify(link, Characteristic::Battery).await?;
        self.publish();

        if let Some(payload) = self.deferred.take() {
            debug!("Flushing deferred payload {:02X?}", payload);
            self.transmit(link, payload).await?;
        }
        self.read_battery(link, true).await
    }

    async fn enable_notify<L: GattLink>(
        &mut self,
        link: &mut L,
        characteristic: Characteristic,
    ) -> Result<bool, Exit> {
        let result = self.interruptible(link.subscribe(characteristic)).await;
        match result {
            None => Err(Exit::Stopped),
            Some(Ok(())) => {
                info!("Notifications enabled on {} characteristic", characteristic);
                Ok(true)
            }
            Some(Err(e)) if e.is_link_lost() => Err(Exit::LinkLost(e.to_string())),
            Some(Err(e)) => {
                warn!("Could not subscribe to {}: {}", characteristic, e);
                let label = match characteristic {
                    Characteristic::Battery => "Battery",
                    _ => "Status",
                };
                self.bus.warn(format!("{} notify failed: {}", label, e));
                Ok(false)
            }
        }
    }

    async fn submit<L: GattLink>(&mut self, link: &mut L, change: StateChange) -> Result<(), Exit> {
        if self.state.apply(&change) {
            self.publish();
        }
        let payload = protocol::encode(&self.state);
        self.transmit(link, payload).await
    }

    /// The only write path to the control characteristic.
    async fn transmit<L: GattLink>(
        &mut self,
        link: &mut L,
        payload: CommandPayload,
    ) -> Result<(), Exit> {
        if !self.limiter.should_send(&payload) {
            trace!("Rate limited {:02X?}", payload);
            return Ok(());
        }

        let result = self
            .committed(link.write(Characteristic::Control, &payload))
            .await;
        match result {
            None => {
                warn!("Write of {:02X?} abandoned after stop", payload);
                Err(Exit::Stopped)
            }
            Some(Ok(())) => {
                debug!("Sent {:02X?}", payload);
                self.state.last_payload = Some(payload);
                self.publish();
                self.bus.post(SessionEvent::Payload(payload));
                Ok(())
            }
            Some(Err(e)) => {
                error!("Control write failed: {}", e);
                self.bus.error(format!("ERROR sending command: {}", e));
                if e.is_link_lost() {
                    Err(Exit::LinkLost(e.to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn read_battery<L: GattLink>(&mut self, link: &mut L, initial: bool) -> Result<(), Exit> {
        let result = self.interruptible(link.read(Characteristic::Battery)).await;
        match result {
            None => Err(Exit::Stopped),
            Some(Ok(data)) => {
                if let Some(&value) = data.first() {
                    info!("Battery level {}%", value);
                    self.last_battery = Some(value);
                    self.state.battery_pct = Some(value);
                    self.publish();
                    self.bus.post(SessionEvent::Battery(value));
                }
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Battery read failed: {}", e);
                let prefix = if initial {
                    "Initial battery read"
                } else {
                    "Battery read"
                };
                self.bus.warn(format!("{} failed: {}", prefix, e));
                if e.is_link_lost() {
                    Err(Exit::LinkLost(e.to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Notification delivery: decode, merge, post. Never suspends.
    fn on_notification(&mut self, characteristic: Characteristic, data: &[u8]) {
        match characteristic {
            Characteristic::Status => {
                if self.last_status_raw.as_deref() == Some(data) {
                    return;
                }
                self.last_status_raw = Some(data.to_vec());
                let record = protocol::decode(data);
                trace!("Status notification: {}", record);
                self.state.last_status_hex = hex::encode(data);
                self.state.last_status = Some(record.clone());
                self.publish();
                self.bus.post(SessionEvent::Status(record));
            }
            Characteristic::Battery => {
                let Some(&value) = data.first() else {
                    return;
                };
                if self.last_battery == Some(value) {
                    return;
                }
                self.last_battery = Some(value);
                self.state.battery_pct = Some(value);
                self.publish();
                self.bus.post(SessionEvent::Battery(value));
            }
            Characteristic::Control => {
                debug!("Ignoring notification on control characteristic");
            }
        }
    }

    async fn teardown<L: GattLink>(&mut self, link: &mut L, exit: Exit) {
        self.set_phase(SessionPhase::Disconnecting);
        match exit {
            Exit::Stopped => info!("Stopping session"),
            Exit::LinkLost(reason) => {
                error!("Link lost: {}", reason);
                self.bus.error(format!("Connection lost: {}", reason));
            }
        }

        for characteristic in [Characteristic::Status, Characteristic::Battery] {
            let active = match characteristic {
                Characteristic::Status => std::mem::take(&mut self.status_notify),
                _ => std::mem::take(&mut self.battery_notify),
            };
            if !active {
                continue;
            }
            match tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, link.unsubscribe(characteristic)).await
            {
                Ok(Ok(())) => debug!("Unsubscribed from {}", characteristic),
                Ok(Err(e)) => debug!("Unsubscribe from {} failed: {}", characteristic, e),
                Err(_) => debug!("Unsubscribe from {} timed out", characteristic),
            }
        }
        self.publish();

        if tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, link.disconnect())
            .await
            .is_err()
        {
            warn!("Disconnect timed out; dropping link");
        }
    }

    /// Run a link operation, abandoning it if `stop()` is called while it is
    /// pending. An operation that is already complete still wins.
    async fn interruptible<F: Future>(&self, op: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = op => Some(output),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Run a write that has already been dequeued. `stop()` does not cut it
    /// short; it only starts a `TEARDOWN_STEP_TIMEOUT` deadline.
    async fn committed<F: Future>(&self, op: F) -> Option<F::Output> {
        let deadline = async {
            self.cancel.cancelled().await;
            tokio::time::sleep(TEARDOWN_STEP_TIMEOUT).await;
        };
        tokio::select! {
            biased;
            output = op => Some(output),
            _ = deadline => None,
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!("Session phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            phase: self.phase,
            state: self.state.clone(),
            status_notify: self.status_notify,
            battery_notify: self.battery_notify,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{FlagUpdate, Throttle, TelemetryRecord};
    use crate::infrastructure::bluetooth::event_bus::EventReceiver;
    use crate::infrastructure::bluetooth::link::{LinkError, LinkEventSender};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use std::rc::Rc;

    #[derive(Default)]
    struct LinkLog {
        writes: Vec<Vec<u8>>,
        subscribed: Vec<Characteristic>,
        unsubscribed: Vec<Characteristic>,
        disconnected: bool,
        events: Option<LinkEventSender>,
    }

    #[derive(Clone, Default)]
    struct Script {
        fail_connect: bool,
        hang_connect: bool,
        connect_delay: Option<Duration>,
        fail_subscribe: HashSet<Characteristic>,
        fail_writes: usize,
        lost_on_write: bool,
        write_delay: Option<Duration>,
        /// Per-call battery read results, `None` fails. Falls back to `battery`.
        reads: VecDeque<Option<u8>>,
        battery: Option<u8>,
    }

    struct ScriptedConnector {
        script: Script,
        log: Rc<RefCell<LinkLog>>,
    }

    struct ScriptedLink {
        script: Script,
        log: Rc<RefCell<LinkLog>>,
        failed_writes: usize,
    }

    #[async_trait(?Send)]
    impl LinkConnector for ScriptedConnector {
        type Link = ScriptedLink;

        async fn connect(
            &self,
            _address: BleAddress,
            events: LinkEventSender,
        ) -> Result<ScriptedLink, LinkError> {
            if self.script.hang_connect {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.script.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if self.script.fail_connect {
                return Err(LinkError::Platform("adapter off".to_string()));
            }
            self.log.borrow_mut().events = Some(events);
            Ok(ScriptedLink {
                script: self.script.clone(),
                log: self.log.clone(),
                failed_writes: 0,
            })
        }
    }

    #[async_trait(?Send)]
    impl GattLink for ScriptedLink {
        async fn subscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError> {
            if self.script.fail_subscribe.contains(&characteristic) {
                return Err(LinkError::Gatt {
                    operation: "subscribe",
                    characteristic,
                    status: "Unreachable".to_string(),
                });
            }
            self.log.borrow_mut().subscribed.push(characteristic);
            Ok(())
        }

        async fn unsubscribe(&mut self, characteristic: Characteristic) -> Result<(), LinkError> {
            self.log.borrow_mut().unsubscribed.push(characteristic);
            Ok(())
        }

        async fn write(
            &mut self,
            characteristic: Characteristic,
            payload: &[u8],
        ) -> Result<(), LinkError> {
            if let Some(delay) = self.script.write_delay {
                tokio::time::sleep(delay).await;
            }
            if self.script.lost_on_write {
                return Err(LinkError::LinkLost);
            }
            if self.failed_writes < self.script.fail_writes {
                self.failed_writes += 1;
                return Err(LinkError::Gatt {
                    operation: "write",
                    characteristic,
                    status: "ProtocolError".to_string(),
                });
            }
            self.log.borrow_mut().writes.push(payload.to_vec());
            Ok(())
        }

        async fn read(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, LinkError> {
            if characteristic != Characteristic::Battery {
                return Err(LinkError::CharacteristicNotFound(characteristic));
            }
            let value = match self.script.reads.pop_front() {
                Some(scripted) => scripted,
                None => self.script.battery,
            };
            match value {
                Some(value) => Ok(vec![value]),
                None => Err(LinkError::Gatt {
                    operation: "read",
                    characteristic,
                    status: "Unreachable".to_string(),
                }),
            }
        }

        async fn disconnect(&mut self) {
            self.log.borrow_mut().disconnected = true;
        }
    }

    type Fixture = (
        ConnectionSession<ScriptedConnector>,
        SessionHandle,
        EventReceiver,
        Rc<RefCell<LinkLog>>,
    );

    fn session(script: Script) -> Fixture {
        session_with_capacity(script, 64)
    }

    fn session_with_capacity(script: Script, capacity: usize) -> Fixture {
        let log = Rc::new(RefCell::new(LinkLog::default()));
        let (bus, events) = EventBus::bounded(capacity);
        let connector = ScriptedConnector {
            script,
            log: log.clone(),
        };
        let (session, handle) = ConnectionSession::new(
            connector,
            BleAddress::from_raw(0xAABB_CCDD_EEFF),
            SessionConfig::default(),
            bus,
        );
        (session, handle, events, log)
    }

    /// Wait until the initial battery read has been reported, i.e. setup is done.
    async fn until_ready(events: &mut EventReceiver) -> Vec<SessionEvent> {
        until(events, |event| matches!(event, SessionEvent::Battery(_))).await
    }

    /// Collect events up to and including the first one matching `done`.
    async fn until(
        events: &mut EventReceiver,
        done: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
        seen
    }

    fn is_warning(prefix: &'static str) -> impl Fn(&SessionEvent) -> bool {
        move |event| matches!(event, SessionEvent::Warn(text) if text.starts_with(prefix))
    }

    fn count(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
        events.iter().filter(|&event| pred(event)).count()
    }

    fn notify(log: &Rc<RefCell<LinkLog>>, characteristic: Characteristic, data: &[u8]) {
        let sender = log.borrow().events.clone().unwrap();
        sender
            .send(LinkEvent::Notification {
                characteristic,
                data: data.to_vec(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_subscription_failure_is_a_warning() {
        let script = Script {
            fail_subscribe: [Characteristic::Status].into_iter().collect(),
            battery: Some(64),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            let seen = until_ready(&mut events).await;
            let snapshot = handle.snapshot();
            handle.stop();
            (seen, snapshot)
        };
        let (_, (seen, snapshot)) = tokio::join!(session.run(), driver);

        assert_eq!(snapshot.phase, SessionPhase::Connected);
        assert!(!snapshot.status_notify);
        assert!(snapshot.battery_notify);
        assert_eq!(snapshot.state.battery_pct, Some(64));
        assert_eq!(
            count(&seen, |e| matches!(e, SessionEvent::Warn(text) if text.starts_with("Status notify failed"))),
            1
        );
        assert!(seen.contains(&SessionEvent::Connected));

        let log = log.borrow();
        assert_eq!(log.subscribed, vec![Characteristic::Battery]);
        assert_eq!(log.unsubscribed, vec![Characteristic::Battery]);
        assert!(log.disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_changes_write_once() {
        let script = Script {
            battery: Some(90),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let rest = events.drain();
        assert_eq!(count(&rest, |e| matches!(e, SessionEvent::Payload(_))), 1);
        assert!(rest.contains(&SessionEvent::Payload([1, 1, 0, 0, 0, 0, 0, 0])));
        assert_eq!(log.borrow().writes, vec![vec![1, 1, 0, 0, 0, 0, 0, 0]]);
        assert_eq!(
            handle.snapshot().state.last_payload,
            Some([1, 1, 0, 0, 0, 0, 0, 0])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_state_is_never_rate_limited() {
        let script = Script {
            battery: Some(90),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            handle.submit_state_change(StateChange {
                lights: Some(FlagUpdate::Toggle),
                ..Default::default()
            });
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        assert_eq!(
            log.borrow().writes,
            vec![vec![1, 1, 0, 0, 0, 0, 0, 0], vec![1, 1, 0, 0, 0, 1, 0, 0]]
        );
    }

    #[tokio::test]
    async fn test_duplicate_status_notifications_are_dropped() {
        let script = Script {
            battery: Some(50),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            notify(&log, Characteristic::Status, &[0; 8]);
            notify(&log, Characteristic::Status, &[0; 8]);
            notify(&log, Characteristic::Battery, &[50]);
            notify(&log, Characteristic::Battery, &[49]);
            notify(&log, Characteristic::Status, &[1, 2, 3]);
            // Let the session drain the link queue before stopping.
            loop {
                tokio::task::yield_now().await;
                if handle.snapshot().state.last_status_hex == "010203" {
                    break;
                }
            }
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let rest = events.drain();
        let statuses: Vec<_> = rest
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Status(record) => Some(record.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1], TelemetryRecord::Raw { length: 3, raw: "010203".to_string() });
        // 50 was already reported by the initial read.
        assert_eq!(count(&rest, |e| matches!(e, SessionEvent::Battery(_))), 1);
        assert!(rest.contains(&SessionEvent::Battery(49)));
    }

    #[tokio::test]
    async fn test_stop_twice_disconnects_once() {
        let script = Script {
            battery: Some(10),
            ..Default::default()
        };
        let (session, handle, mut events, _log) = session(script);

        let driver = async {
            let mut seen = until_ready(&mut events).await;
            handle.stop();
            handle.stop();
            while let Some(event) = events.next().await {
                seen.push(event);
            }
            seen
        };
        let (_, seen) = tokio::join!(session.run(), driver);
        handle.stop();

        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        assert_eq!(count(&seen, |e| *e == SessionEvent::Shutdown), 1);
        assert_eq!(count(&seen, |e| matches!(e, SessionEvent::Error(_))), 0);
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_interrupts_pending_connect() {
        let script = Script {
            hang_connect: true,
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            handle.wait_for_phase(SessionPhase::Connecting).await;
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let seen = events.drain();
        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        assert_eq!(count(&seen, |e| matches!(e, SessionEvent::Error(_))), 0);
        assert!(!log.borrow().disconnected);
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let script = Script {
            fail_connect: true,
            ..Default::default()
        };
        let (session, handle, mut events, _log) = session(script);
        session.run().await;

        let seen = events.drain();
        assert!(seen.contains(&SessionEvent::Error(
            "Connection error: adapter off".to_string()
        )));
        assert_eq!(seen[seen.len() - 2], SessionEvent::Disconnected);
        assert_eq!(seen[seen.len() - 1], SessionEvent::Shutdown);
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let script = Script {
            hang_connect: true,
            ..Default::default()
        };
        let (session, _handle, mut events, _log) = session(script);
        session.run().await;

        let seen = events.drain();
        assert!(seen.contains(&SessionEvent::Error(
            "Connection error: timed out after 45s".to_string()
        )));
    }

    #[tokio::test]
    async fn test_link_drop_tears_down() {
        let script = Script {
            battery: Some(77),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            log.borrow()
                .events
                .clone()
                .unwrap()
                .send(LinkEvent::Dropped)
                .unwrap();
        };
        tokio::join!(session.run(), driver);

        let seen = events.drain();
        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(text) if text.starts_with("Connection lost"))));
        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        let log = log.borrow();
        assert_eq!(
            log.unsubscribed,
            vec![Characteristic::Status, Characteristic::Battery]
        );
        assert!(log.disconnected);
        let snapshot = handle.snapshot();
        assert!(!snapshot.status_notify && !snapshot.battery_notify);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_keeps_session_connected() {
        let script = Script {
            battery: Some(30),
            fail_writes: 1,
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            let failure = events.next().await;
            let phase = handle.phase();
            handle.submit_state_change(StateChange::throttle(Throttle::Reverse));
            handle.stop();
            (failure, phase)
        };
        let (_, (failure, phase)) = tokio::join!(session.run(), driver);

        assert!(matches!(&failure, Some(SessionEvent::Error(text)) if text.starts_with("ERROR sending command")));
        assert_eq!(phase, SessionPhase::Connected);
        assert_eq!(log.borrow().writes, vec![vec![1, 0, 1, 0, 0, 0, 0, 0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_while_connecting_are_flushed_after_setup() {
        let script = Script {
            battery: Some(80),
            connect_delay: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            handle.wait_for_phase(SessionPhase::Connecting).await;
            handle.submit_state_change(StateChange {
                donut: Some(FlagUpdate::Set(true)),
                ..Default::default()
            });
            handle.request_battery();
            let seen = until_ready(&mut events).await;
            handle.stop();
            seen
        };
        let (_, seen) = tokio::join!(session.run(), driver);

        assert!(seen.contains(&SessionEvent::Message(
            "Battery read queued; waiting for connection".to_string()
        )));
        assert!(seen.contains(&SessionEvent::Payload([1, 0, 0, 0, 0, 0, 0, 1])));
        assert_eq!(log.borrow().writes, vec![vec![1, 0, 0, 0, 0, 0, 0, 1]]);
    }

    #[tokio::test]
    async fn test_commands_after_disconnect_are_ignored() {
        let script = Script {
            fail_connect: true,
            ..Default::default()
        };
        let (session, handle, _events, log) = session(script);
        session.run().await;

        handle.submit_state_change(StateChange::throttle(Throttle::Forward));
        handle.request_battery();
        handle.stop();
        assert!(log.borrow().writes.is_empty());
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
        assert_eq!(handle.wait_for_phase(SessionPhase::Connected).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neutral_before_stop_survives_a_slow_write() {
        let script = Script {
            battery: Some(90),
            write_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            until(&mut events, |e| matches!(e, SessionEvent::Payload(_))).await;
            handle.submit_state_change(StateChange::neutral());
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let log = log.borrow();
        assert_eq!(
            log.writes,
            vec![vec![1, 1, 0, 0, 0, 0, 0, 0], vec![1, 0, 0, 0, 0, 0, 0, 0]]
        );
        assert!(log.disconnected);
        assert_eq!(handle.snapshot().state.last_payload, Some([1, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_gives_up_on_a_hung_write() {
        let script = Script {
            battery: Some(90),
            write_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            let started = tokio::time::Instant::now();
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
            handle.stop();
            started
        };
        let (_, started) = tokio::join!(session.run(), driver);

        assert!(started.elapsed() < Duration::from_secs(10));
        let seen = events.drain();
        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        assert_eq!(count(&seen, |e| matches!(e, SessionEvent::Error(_))), 0);
        let log = log.borrow();
        assert!(log.writes.is_empty());
        assert!(log.disconnected);
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_battery_request_while_connected() {
        let script = Script {
            reads: VecDeque::from([Some(40)]),
            battery: Some(35),
            ..Default::default()
        };
        let (session, handle, mut events, _log) = session(script);

        let driver = async {
            let initial = until_ready(&mut events).await;
            handle.request_battery();
            let refreshed = until(&mut events, |e| matches!(e, SessionEvent::Battery(_))).await;
            let snapshot = handle.snapshot();
            handle.stop();
            (initial, refreshed, snapshot)
        };
        let (_, (initial, refreshed, snapshot)) = tokio::join!(session.run(), driver);

        assert_eq!(initial.last(), Some(&SessionEvent::Battery(40)));
        assert_eq!(refreshed.last(), Some(&SessionEvent::Battery(35)));
        assert_eq!(snapshot.state.battery_pct, Some(35));
    }

    #[tokio::test]
    async fn test_battery_read_failures_are_warnings() {
        let script = Script {
            reads: VecDeque::from([None, None]),
            battery: Some(20),
            ..Default::default()
        };
        let (session, handle, mut events, _log) = session(script);

        let driver = async {
            let initial = until(&mut events, is_warning("Initial battery read failed")).await;
            handle.request_battery();
            let refresh = until(&mut events, is_warning("Battery read failed")).await;
            let phase = handle.phase();
            handle.stop();
            (initial, refresh, phase)
        };
        let (_, (initial, refresh, phase)) = tokio::join!(session.run(), driver);

        assert!(initial.contains(&SessionEvent::Connected));
        assert_eq!(count(&refresh, is_warning("Battery read failed")), 1);
        assert_eq!(phase, SessionPhase::Connected);
        assert_eq!(handle.snapshot().state.battery_pct, None);
    }

    #[tokio::test]
    async fn test_battery_subscription_failure_is_a_warning() {
        let script = Script {
            fail_subscribe: [Characteristic::Battery].into_iter().collect(),
            battery: Some(64),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            let seen = until_ready(&mut events).await;
            let snapshot = handle.snapshot();
            handle.stop();
            (seen, snapshot)
        };
        let (_, (seen, snapshot)) = tokio::join!(session.run(), driver);

        assert_eq!(snapshot.phase, SessionPhase::Connected);
        assert!(snapshot.status_notify);
        assert!(!snapshot.battery_notify);
        assert_eq!(count(&seen, is_warning("Battery notify failed")), 1);

        let log = log.borrow();
        assert_eq!(log.subscribed, vec![Characteristic::Status]);
        assert_eq!(log.unsubscribed, vec![Characteristic::Status]);
        assert!(log.disconnected);
    }

    #[tokio::test]
    async fn test_link_lost_during_write_tears_down() {
        let script = Script {
            battery: Some(70),
            lost_on_write: true,
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            handle.submit_state_change(StateChange::throttle(Throttle::Forward));
        };
        tokio::join!(session.run(), driver);

        let seen = events.drain();
        assert!(seen.contains(&SessionEvent::Error("ERROR sending command: link lost".to_string())));
        assert!(seen.contains(&SessionEvent::Error("Connection lost: link lost".to_string())));
        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        let log = log.borrow();
        assert!(log.writes.is_empty());
        assert_eq!(
            log.unsubscribed,
            vec![Characteristic::Status, Characteristic::Battery]
        );
        assert!(log.disconnected);
        assert_eq!(handle.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_empty_first_status_counts_as_repeat() {
        let script = Script {
            battery: Some(50),
            ..Default::default()
        };
        let (session, handle, mut events, log) = session(script);

        let driver = async {
            until_ready(&mut events).await;
            notify(&log, Characteristic::Status, &[]);
            notify(&log, Characteristic::Status, &[0; 8]);
            loop {
                tokio::task::yield_now().await;
                if !handle.snapshot().state.last_status_hex.is_empty() {
                    break;
                }
            }
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let statuses = count(&events.drain(), |e| matches!(e, SessionEvent::Status(_)));
        assert_eq!(statuses, 1);
        assert_eq!(handle.snapshot().state.last_status_hex, "0000000000000000");
    }

    #[tokio::test]
    async fn test_closing_events_fit_a_full_bus() {
        let script = Script {
            battery: Some(50),
            ..Default::default()
        };
        // One free slot: the "Connecting..." message fills it.
        let (session, handle, mut events, _log) = session_with_capacity(script, 3);

        let driver = async {
            handle.wait_for_phase(SessionPhase::Connected).await;
            handle.stop();
        };
        tokio::join!(session.run(), driver);

        let seen = events.drain();
        assert_eq!(count(&seen, |e| *e == SessionEvent::Disconnected), 1);
        assert_eq!(seen.last(), Some(&SessionEvent::Shutdown));
        assert!(!seen.contains(&SessionEvent::Connected));
    }
}
