use std::fmt;

use crate::ModifierError;

#[derive(Default)]
pub struct MultiError {
    errors: Vec<ModifierError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, error: ModifierError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ModifierError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), ModifierError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Box::new(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiError({self})")
    }
}

impl std::error::Error for MultiError {}
