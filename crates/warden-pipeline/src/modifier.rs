use warden_http::{Request, Response};

use crate::fifo::Group;
use crate::ModifierError;

pub trait RequestModifier: Send + Sync {
    fn modify_request(&self, req: &mut Request) -> Result<(), ModifierError>;

    fn as_request_verifier(&self) -> Option<&dyn RequestVerifier> {
        None
    }

    fn as_group(&self) -> Option<&Group> {
        None
    }
}

pub trait ResponseModifier: Send + Sync {
    fn modify_response(&self, res: &mut Response) -> Result<(), ModifierError>;

    fn as_response_verifier(&self) -> Option<&dyn ResponseVerifier> {
        None
    }

    fn as_group(&self) -> Option<&Group> {
        None
    }
}

pub trait RequestVerifier: Send + Sync {
    fn verify_requests(&self) -> Result<(), ModifierError>;
    fn reset_request_verifications(&self);
}

pub trait ResponseVerifier: Send + Sync {
    fn verify_responses(&self) -> Result<(), ModifierError>;
    fn reset_response_verifications(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl RequestModifier for Noop {
    fn modify_request(&self, _req: &mut Request) -> Result<(), ModifierError> {
        Ok(())
    }
}

impl ResponseModifier for Noop {
    fn modify_response(&self, _res: &mut Response) -> Result<(), ModifierError> {
        Ok(())
    }
}
