//! Per-fork consensus rule change deployments (BIP135-style).

/// Versionbit positions of the configured deployments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeploymentPos {
    /// CHECKDATASIG opcodes and the extended sigop count.
    Cdsv = 0,
    /// BIP68/BIP112 relative lock-times and BIP113 median-time-past lock-time.
    Csv = 1,
    /// Reserved bit for deployment testing.
    TestDummy = 28,
}

pub const MAX_VERSION_BITS_DEPLOYMENTS: usize = 29;

impl DeploymentPos {
    pub fn bit(self) -> u32 {
        self as u32
    }

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

/// One consensus rule change tallied over versionbits windows.
#[derive(Clone, Copy, Debug)]
pub struct ForkDeployment {
    /// Deployment name.
    pub name: &'static str,
    /// Whether GBT clients can safely ignore this rule in simplified usage.
    pub gbt_force: bool,
    /// Start median-time for miner confirmation. Can be a date in the past.
    pub start_time: i64,
    /// Timeout/expiry median-time for the deployment attempt.
    pub timeout: i64,
    /// Window size, in blocks, for signal tallying.
    pub window_size: i64,
    /// Signaling blocks per window required for lock-in.
    pub threshold: i64,
    /// Minimum number of blocks to remain in the locked-in state.
    pub min_locked_blocks: i64,
    /// Minimum duration, in median-time seconds, to remain locked in.
    pub min_locked_time: i64,
}
