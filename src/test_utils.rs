use crate::lease::{Client, ClientError, LeaseInfo, Leases, Request};
use crate::time::{add, Alarm, Clock, Timestamp};
use async_trait::async_trait;
use chrono::DateTime;
use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// A time with a comfortable h:m:s component but past the i32 unix epoch
/// limit, at a 5ns offset so lost precision shows, in an unusual zone.
pub const DEFAULT_CLOCK_START: &str = "2073-03-03T01:00:00.000000005-08:40";

pub fn default_clock_start() -> Timestamp {
    DateTime::parse_from_rfc3339(DEFAULT_CLOCK_START).expect("valid default clock start")
}

/// `default_clock_start() + d`
pub fn offset(d: Duration) -> Timestamp {
    add(default_clock_start(), d)
}

/// A duration one nanosecond short of `seconds` seconds.
pub fn almost_seconds(seconds: u64) -> Duration {
    assert!(seconds >= 1, "almost_seconds needs at least one second");
    Duration::from_secs(seconds) - Duration::from_nanos(1)
}

/// Installs a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

struct ClockState {
    now: Timestamp,
    alarms: Vec<(Timestamp, oneshot::Sender<()>)>,
}

/// Clock that only moves when told to. Alarms fire as soon as the clock is
/// moved to or past their deadline.
pub struct VirtualClock {
    state: Mutex<ClockState>,
    registered: watch::Sender<usize>,
}

impl VirtualClock {
    pub fn new(now: Timestamp) -> Self {
        let (registered, _) = watch::channel(0);
        Self {
            state: Mutex::new(ClockState {
                now,
                alarms: Vec::new(),
            }),
            registered,
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut state = self.state.lock();
        state.now = add(state.now, d);
        Self::fire_due(&mut state);
    }

    /// Jumps to `now`, which may lie in the past.
    pub fn set(&self, now: Timestamp) {
        let mut state = self.state.lock();
        state.now = now;
        Self::fire_due(&mut state);
    }

    /// Number of alarms handed out so far.
    pub fn alarms_registered(&self) -> usize {
        *self.registered.borrow()
    }

    /// Waits until at least `count` alarms have been handed out.
    pub async fn wait_for_alarms(&self, count: usize) {
        let mut rx = self.registered.subscribe();
        let _ = rx.wait_for(|registered| *registered >= count).await;
    }

    fn fire_due(state: &mut ClockState) {
        let now = state.now;
        let (due, pending): (Vec<_>, Vec<_>) = state
            .alarms
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        state.alarms = pending;
        for (_, alarm) in due {
            let _ = alarm.send(());
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(default_clock_start())
    }
}

impl fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("pending_alarms", &state.alarms.len())
            .finish()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Timestamp {
        self.state.lock().now
    }

    fn after(&self, duration: Duration) -> Alarm {
        let alarm = if duration.is_zero() {
            future::ready(()).boxed()
        } else {
            let (tx, rx) = oneshot::channel();
            let mut state = self.state.lock();
            let deadline = add(state.now, duration);
            state.alarms.push((deadline, tx));
            async move {
                let _ = rx.await;
            }
            .boxed()
        };
        self.registered.send_modify(|registered| *registered += 1);
        alarm
    }
}

/// A store call as seen by `ScriptedClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Claim { name: String, request: Request },
    Extend { name: String, request: Request },
    Expire { name: String },
    Release { name: String, holder: String },
    Refresh,
}

type Effect = Box<dyn FnOnce(&mut Leases) + Send>;

/// One expected call, what it should return, and what it does to the leases
/// the client reports.
pub struct Expectation {
    call: Call,
    error: Option<ClientError>,
    effect: Option<Effect>,
}

impl Expectation {
    pub fn new(call: Call) -> Self {
        Self {
            call,
            error: None,
            effect: None,
        }
    }

    pub fn claim(name: &str, holder: &str, duration: Duration) -> Self {
        Self::new(Call::Claim {
            name: name.to_string(),
            request: Request::new(holder, duration),
        })
    }

    pub fn extend(name: &str, holder: &str, duration: Duration) -> Self {
        Self::new(Call::Extend {
            name: name.to_string(),
            request: Request::new(holder, duration),
        })
    }

    pub fn expire(name: &str) -> Self {
        Self::new(Call::Expire {
            name: name.to_string(),
        })
    }

    pub fn release(name: &str, holder: &str) -> Self {
        Self::new(Call::Release {
            name: name.to_string(),
            holder: holder.to_string(),
        })
    }

    pub fn refresh() -> Self {
        Self::new(Call::Refresh)
    }

    pub fn fails(mut self, error: ClientError) -> Self {
        self.error = Some(error);
        self
    }

    /// Runs `effect` on the reported leases when the call is made, before the
    /// scripted result is returned.
    pub fn with_effect(mut self, effect: impl FnOnce(&mut Leases) + Send + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("call", &self.call)
            .field("error", &self.error)
            .field("effect", &self.effect.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Script {
    leases: Leases,
    expected: VecDeque<Expectation>,
    deviations: Vec<String>,
}

/// `Client` that plays back a fixed sequence of expected calls. Calls that
/// deviate from the script fail with `ClientError::Other` and are recorded for
/// `verify()`.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub fn new(leases: Leases, expected: Vec<Expectation>) -> Self {
        Self {
            script: Mutex::new(Script {
                leases,
                expected: expected.into(),
                deviations: Vec::new(),
            }),
        }
    }

    /// Deviations plus any expected calls that were never made.
    pub fn verify(&self) -> Vec<String> {
        let script = self.script.lock();
        let mut problems = script.deviations.clone();
        problems.extend(
            script
                .expected
                .iter()
                .map(|expectation| format!("missing call: {:?}", expectation.call)),
        );
        problems
    }

    fn play(&self, call: Call) -> Result<Leases, ClientError> {
        let mut script = self.script.lock();
        let deviation = match script.expected.front() {
            Some(expectation) if expectation.call == call => None,
            Some(expectation) => Some(format!("expected {:?}, got {:?}", expectation.call, call)),
            None => Some(format!("unexpected call: {:?}", call)),
        };
        if let Some(deviation) = deviation {
            script.deviations.push(deviation.clone());
            return Err(ClientError::Other(deviation));
        }
        let Some(expectation) = script.expected.pop_front() else {
            return Err(ClientError::Other("script exhausted".to_string()));
        };
        if let Some(effect) = expectation.effect {
            effect(&mut script.leases);
        }
        match expectation.error {
            Some(error) => Err(error),
            None => Ok(script.leases.clone()),
        }
    }

    fn granted(name: &str, leases: Leases) -> Result<LeaseInfo, ClientError> {
        leases
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::Other(format!("script left no lease for {name:?}")))
    }
}

#[async_trait]
impl Client for ScriptedClient {
    async fn claim_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError> {
        let leases = self.play(Call::Claim {
            name: name.to_string(),
            request,
        })?;
        Self::granted(name, leases)
    }

    async fn extend_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError> {
        let leases = self.play(Call::Extend {
            name: name.to_string(),
            request,
        })?;
        Self::granted(name, leases)
    }

    async fn expire_lease(&self, name: &str) -> Result<(), ClientError> {
        self.play(Call::Expire {
            name: name.to_string(),
        })
        .map(|_| ())
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ClientError> {
        self.play(Call::Release {
            name: name.to_string(),
            holder: holder.to_string(),
        })
        .map(|_| ())
    }

    fn leases(&self) -> Leases {
        self.script.lock().leases.clone()
    }

    async fn refresh(&self) -> Result<(), ClientError> {
        self.play(Call::Refresh).map(|_| ())
    }
}
