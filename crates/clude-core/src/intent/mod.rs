//! Intent classification and profile routing.

pub mod classifier;
pub mod router;

pub use classifier::{classify, classify_keywords, Classified, Intent};
pub use router::{IntentRegistry, ProfileRouter, RoutedProfile};
