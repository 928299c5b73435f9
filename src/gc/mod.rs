// ============================================================================
// Tombstone garbage collection
// ============================================================================
//
// Steps, in order, each retried with the configured backoffs:
//   1. tombstone groups whose hosting ended
//   2. remove expired members, tombstone groups left without any
//   3. purge tombstoned entities whose purge date came (rows, subs, files)
//      and re-stamp their version record far in the future
//   4. turn expired upload transfers into file-purge intents
//   5. drain the file-purge intents
//   6. remove purged version records past retention and expired invitations
// ============================================================================

pub mod checkpoint;
pub mod pipeline;
pub mod steps;
pub mod worker;

pub use checkpoint::{CHECKPOINT_ID, Checkpoint, StepLog, StepStats};
pub use steps::GcStep;
pub use worker::{GcWorker, spawn_gc_worker};
