//! Git worktree provisioning for runs.
//!
//! Every run gets its own branch and linked working tree under a scratch
//! root, so concurrent runs never share mutable file state.

mod provisioner;

pub use provisioner::{ProvisionedWorktree, WorktreeError, WorktreeProvisioner, changed_paths};
