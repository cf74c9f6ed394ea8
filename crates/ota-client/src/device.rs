//! Device-side collaborators: boot slot, clock trust and restart.

use std::sync::Arc;

use parking_lot::Mutex;

/// One of the two boot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// The slot that is not `self`.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Index into a region pair.
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "a"),
            Self::B => write!(f, "b"),
        }
    }
}

impl std::str::FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "0" => Ok(Self::A),
            "b" | "1" => Ok(Self::B),
            other => Err(format!("unknown slot: {other}")),
        }
    }
}

/// How the device should come back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    /// Boot the main image in `Slot` from now on.
    Boot(Slot),
    /// Boot the boot-stage image in `Slot` once, to let it install itself.
    TempBoot(Slot),
}

/// The device the client runs on.
pub trait Device: Send {
    /// Slot the running image was booted from.
    fn running_slot(&self) -> Slot;

    /// Whether this is the first start after provisioning.
    fn is_first_boot(&self) -> bool;

    /// Whether the wall clock is good enough to check certificate validity.
    fn time_is_trusted(&self) -> bool;

    /// Request a restart. Real devices do not return from this.
    fn restart(&mut self, request: RestartRequest);
}

#[derive(Debug)]
struct SimulatedState {
    running: Slot,
    first_boot: bool,
    time_trusted: bool,
    restarts: Vec<RestartRequest>,
}

/// Device stand-in that records restart requests. Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedDevice {
    pub fn new(running: Slot) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                running,
                first_boot: false,
                time_trusted: true,
                restarts: Vec::new(),
            })),
        }
    }

    pub fn with_first_boot(self, first_boot: bool) -> Self {
        self.state.lock().first_boot = first_boot;
        self
    }

    pub fn with_trusted_time(self, trusted: bool) -> Self {
        self.state.lock().time_trusted = trusted;
        self
    }

    /// Restart requests received so far.
    pub fn restarts(&self) -> Vec<RestartRequest> {
        self.state.lock().restarts.clone()
    }
}

impl Device for SimulatedDevice {
    fn running_slot(&self) -> Slot {
        self.state.lock().running
    }

    fn is_first_boot(&self) -> bool {
        self.state.lock().first_boot
    }

    fn time_is_trusted(&self) -> bool {
        self.state.lock().time_trusted
    }

    fn restart(&mut self, request: RestartRequest) {
        tracing::info!("Simulated restart: {:?}", request);
        self.state.lock().restarts.push(request);
    }
}
