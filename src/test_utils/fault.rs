//! Fault injection primitives used by the mock storage client

#[derive(Debug, Clone)]
pub enum When {
    Always,
    Never,
}

/// A fault is an error that is returned based on the [`When`]
#[derive(Clone, Debug)]
pub struct Fault {
    pub when: When,
}

impl Fault {
    pub fn active(&self) -> bool {
        matches!(self.when, When::Always)
    }
}

impl Default for Fault {
    fn default() -> Self {
        Self { when: When::Never }
    }
}
