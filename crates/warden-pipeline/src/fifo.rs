use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use warden_http::{Request, Response};

use crate::modifier::{RequestModifier, ResponseModifier};
use crate::multierror::MultiError;
use crate::ModifierError;

fn run_request_entries(
    entries: &[Arc<dyn RequestModifier>],
    aggregate: bool,
    req: &mut Request,
) -> Result<(), ModifierError> {
    let mut merr = MultiError::new();
    for entry in entries {
        if let Err(error) = entry.modify_request(req) {
            if aggregate {
                merr.add(error);
                continue;
            }
            return Err(error);
        }
    }
    merr.into_result()
}

fn run_response_entries(
    entries: &[Arc<dyn ResponseModifier>],
    aggregate: bool,
    res: &mut Response,
) -> Result<(), ModifierError> {
    let mut merr = MultiError::new();
    for entry in entries {
        if let Err(error) = entry.modify_response(res) {
            if aggregate {
                merr.add(error);
                continue;
            }
            return Err(error);
        }
    }
    merr.into_result()
}

#[derive(Default)]
pub struct Group {
    aggregate_errors: AtomicBool,
    reqmods: RwLock<Vec<Arc<dyn RequestModifier>>>,
    resmods: RwLock<Vec<Arc<dyn ResponseModifier>>>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_aggregate_errors(&self, aggregate: bool) {
        self.aggregate_errors.store(aggregate, Ordering::Relaxed);
    }

    pub fn aggregate_errors(&self) -> bool {
        self.aggregate_errors.load(Ordering::Relaxed)
    }

    pub fn add_request_modifier(&self, modifier: Arc<dyn RequestModifier>) {
        self.reqmods
            .write()
            .expect("request modifier list poisoned")
            .push(modifier);
    }

    pub fn add_response_modifier(&self, modifier: Arc<dyn ResponseModifier>) {
        self.resmods
            .write()
            .expect("response modifier list poisoned")
            .push(modifier);
    }

    pub fn verify_requests(&self) -> Result<(), ModifierError> {
        let entries = self.reqmods.write().expect("request modifier list poisoned");
        let mut merr = MultiError::new();
        for entry in entries.iter() {
            if let Some(verifier) = entry.as_request_verifier() {
                if let Err(error) = verifier.verify_requests() {
                    merr.add(error);
                }
            }
        }
        merr.into_result()
    }

    pub fn verify_responses(&self) -> Result<(), ModifierError> {
        let entries = self.resmods.write().expect("response modifier list poisoned");
        let mut merr = MultiError::new();
        for entry in entries.iter() {
            if let Some(verifier) = entry.as_response_verifier() {
                if let Err(error) = verifier.verify_responses() {
                    merr.add(error);
                }
            }
        }
        merr.into_result()
    }

    pub fn reset_request_verifications(&self) {
        let entries = self.reqmods.write().expect("request modifier list poisoned");
        for entry in entries.iter() {
            if let Some(verifier) = entry.as_request_verifier() {
                verifier.reset_request_verifications();
            }
        }
    }

    pub fn reset_response_verifications(&self) {
        let entries = self.resmods.write().expect("response modifier list poisoned");
        for entry in entries.iter() {
            if let Some(verifier) = entry.as_response_verifier() {
                verifier.reset_response_verifications();
            }
        }
    }

    pub fn to_immutable(&self) -> ImmutableGroup {
        let aggregate = self.aggregate_errors();

        let entries = self.reqmods.write().expect("request modifier list poisoned");
        let mut reqmods: Vec<Arc<dyn RequestModifier>> = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            match entry.as_group() {
                Some(child) => {
                    let snapshot = child.to_immutable();
                    if aggregate == snapshot.aggregate_errors {
                        reqmods.extend(snapshot.reqmods);
                    } else {
                        reqmods.push(Arc::new(snapshot));
                    }
                }
                None => reqmods.push(Arc::clone(entry)),
            }
        }
        drop(entries);

        let entries = self.resmods.write().expect("response modifier list poisoned");
        let mut resmods: Vec<Arc<dyn ResponseModifier>> = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            match entry.as_group() {
                Some(child) => {
                    let snapshot = child.to_immutable();
                    if aggregate == snapshot.aggregate_errors {
                        resmods.extend(snapshot.resmods);
                    } else {
                        resmods.push(Arc::new(snapshot));
                    }
                }
                None => resmods.push(Arc::clone(entry)),
            }
        }

        ImmutableGroup {
            aggregate_errors: aggregate,
            reqmods,
            resmods,
        }
    }
}

impl RequestModifier for Group {
    fn modify_request(&self, req: &mut Request) -> Result<(), ModifierError> {
        let entries = self.reqmods.read().expect("request modifier list poisoned");
        run_request_entries(&entries, self.aggregate_errors(), req)
    }

    fn as_group(&self) -> Option<&Group> {
        Some(self)
    }
}

impl ResponseModifier for Group {
    fn modify_response(&self, res: &mut Response) -> Result<(), ModifierError> {
        let entries = self.resmods.read().expect("response modifier list poisoned");
        run_response_entries(&entries, self.aggregate_errors(), res)
    }

    fn as_group(&self) -> Option<&Group> {
        Some(self)
    }
}

pub struct ImmutableGroup {
    aggregate_errors: bool,
    reqmods: Vec<Arc<dyn RequestModifier>>,
    resmods: Vec<Arc<dyn ResponseModifier>>,
}

impl ImmutableGroup {
    pub fn aggregate_errors(&self) -> bool {
        self.aggregate_errors
    }

    pub fn request_entry_count(&self) -> usize {
        self.reqmods.len()
    }

    pub fn response_entry_count(&self) -> usize {
        self.resmods.len()
    }
}

impl RequestModifier for ImmutableGroup {
    fn modify_request(&self, req: &mut Request) -> Result<(), ModifierError> {
        run_request_entries(&self.reqmods, self.aggregate_errors, req)
    }
}

impl ResponseModifier for ImmutableGroup {
    fn modify_response(&self, res: &mut Response) -> Result<(), ModifierError> {
        run_response_entries(&self.resmods, self.aggregate_errors, res)
    }
}
