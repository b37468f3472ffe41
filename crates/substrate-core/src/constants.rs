/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Upper bound for any per-entity energy value.
pub const ENERGY_CEILING: f64 = 1.0;

/// Energies below this are dropped from a node's energy map.
pub const CLEANUP_THRESHOLD: f64 = 0.001;

/// Nodes at or below this energy do not diffuse.
pub const DIFFUSION_FLOOR: f64 = 1e-4;

/// Default fraction of energy pushed along a unit-weight edge per second.
pub const DIFFUSION_RATE: f64 = 0.1;

/// Default Hebbian learning rate applied to accepted transfer.
pub const LEARNING_RATE: f64 = 0.01;

/// Edges carrying at least this much transfer in a tick are strengthened.
pub const STRENGTHEN_THRESHOLD: f64 = 0.01;

/// Workspace members decay this many times faster than peripheral nodes.
pub const WORKSPACE_DECAY_MULTIPLIER: f64 = 1.5;

/// Default per-node decay rate (per second).
pub const DEFAULT_DECAY_RATE: f64 = 0.05;

/// Nodes above this energy are candidates for the workspace.
pub const PERIPHERAL_FLOOR: f64 = 0.01;

/// Energy level at which a node is considered to enter the workspace.
pub const WORKSPACE_ENTRY_THRESHOLD: f64 = 0.1;

/// Default workspace capacity in size units.
pub const WORKSPACE_CAPACITY: u32 = 100;

/// Score multiplier for clusters already resident in the workspace.
pub const STABILITY_BONUS: f64 = 1.10;

/// Number of workspace frames kept for co-occurrence statistics.
pub const FRAME_HISTORY_LEN: usize = 64;

/// Affinity given to seeds redirected into an existing entity.
pub const REDIRECT_AFFINITY: f64 = 0.3;

/// Minimum samples before a cohort quantile is trusted.
pub const COHORT_MIN_SAMPLES: usize = 30;

/// Rolling window size for cohort statistics.
pub const COHORT_WINDOW: usize = 512;

/// Recency half-life (in samples) for cohort weighting.
pub const COHORT_HALF_LIFE: f64 = 128.0;
