pub mod challenge;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod exemption;
pub mod ipc;
pub mod monitor;
pub mod watch_loop;


pub use challenge::{ChallengeFlow, ChallengeOutcome, ChallengePrompt, PendingChallenges};
pub use clock::{ManualClock, MonotonicClock, SystemClock};
pub use daemon::Daemon;
pub use exemption::{ActiveExemption, ExemptionEngine, ExemptionWriter};
pub use watch_loop::{Decision, Interposer, WatchLoop};
