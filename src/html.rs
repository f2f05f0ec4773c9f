//! Markup Boundary
//!
//! Tag handling lives outside the core. The frontends only arrange the two
//! calls: strip markup from the source before translation, and re-insert it
//! into the target afterwards using the response's alignments and byte
//! ranges. A pass-through implementation ships so the hooks always have a
//! receiver; embedders supply the real one.

use crate::response::Response;

/// Markup captured from one source string, ready to be restored into its
/// translated response. For pivoted translations, restore runs after the
/// two hops are combined.
pub trait Markup: Send {
    fn restore(&self, response: &mut Response);
}

/// Factory turning raw source text into plain text plus a restore state.
pub trait MarkupProcessor: Send + Sync {
    fn extract(&self, source: &mut String) -> Box<dyn Markup>;
}

/// Leaves text untouched and restores nothing.
pub struct PassthroughMarkup;

impl Markup for PassthroughMarkup {
    fn restore(&self, _response: &mut Response) {}
}

impl MarkupProcessor for PassthroughMarkup {
    fn extract(&self, _source: &mut String) -> Box<dyn Markup> {
        Box::new(PassthroughMarkup)
    }
}
