//! Metric emission.
//!
//! Components describe what happened as small event structs and emit them
//! with `emit!`; each event knows how to record itself through the `metrics`
//! facade. Whichever recorder the host process installs receives the values.

pub mod events;

/// Emit an internal metric event.
///
/// # Example
///
/// ```
/// use tabletsink_core::emit;
/// use tabletsink_core::metrics::events::MutationsApplied;
///
/// emit!(MutationsApplied {
///     count: 10,
///     table: "events".to_string(),
/// });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
