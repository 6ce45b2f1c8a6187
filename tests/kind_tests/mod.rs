//! Integration tests against a live cluster
//!
//! # Test Organization
//!
//! - `volume_rebind`: Stories about moving claims between file systems with
//!   `KubeCluster` doing the real deletes, creates and bind waits
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind volume_rebind -- --ignored --nocapture
//! ```

mod helpers;
mod volume_rebind;
