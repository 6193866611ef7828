mod fifo;
mod modifier;
mod multierror;

pub use fifo::{Group, ImmutableGroup};
pub use modifier::{
    Noop, RequestModifier, RequestVerifier, ResponseModifier, ResponseVerifier,
};
pub use multierror::MultiError;

pub type ModifierError = Box<dyn std::error::Error + Send + Sync + 'static>;
