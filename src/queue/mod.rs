// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! Download queue: persisted FIFO store, background dispatch worker,
//! and the manager tying them to the shared context.

pub mod manager;
pub mod store;
pub mod types;
pub mod worker;

pub use manager::{Disposition, QueueManager};
pub use store::QueueStore;
pub use types::TaskRecord;
