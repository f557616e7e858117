//! Dependency watching.
//!
//! A [`Watcher`] keeps exactly one view per distinct dependency required by
//! the active templates. Each view is an independent task that long-polls
//! the backend, applies results to the [`crate::Brain`] and backs off on
//! failure without affecting other views.
//!
//! ```text
//! set_templates / add_template
//!        │ refcount 0 -> 1                  refcount 1 -> 0
//!        ▼                                       ▼
//!   spawn View ── fetch(last_index) ──▶ Brain::remember ──▶ events()
//!        ▲              │ error                  
//!        └── backoff ◀──┘                   cancel View
//! ```

mod view;
mod watcher;

pub use view::*;
pub use watcher::*;

#[cfg(test)]
mod watcher_test;
