pub mod reconciler;
pub mod release_queue;
