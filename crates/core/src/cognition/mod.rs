pub mod contradiction;
pub mod response;
pub mod self_referent;
pub mod summarizer;

pub use self_referent::SelfReferentClassifier;
