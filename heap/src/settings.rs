use thiserror::Error;

/// Smallest stack accepted for the finalizer thread.
pub const MIN_FINALIZER_STACK_SIZE: usize = 16384;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("finalizer thread name must not be empty")]
    EmptyThreadName,
    #[error("finalizer thread name must not contain NUL bytes")]
    NulInThreadName,
    #[error("finalizer stack size {0} is below the minimum of 16384 bytes")]
    StackTooSmall(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerSettings {
    /// Name given to the finalizer thread.
    pub thread_name: String,
    /// Stack size for the finalizer thread, platform default when `None`.
    pub stack_size: Option<usize>,
}

impl Default for FinalizerSettings {
    fn default() -> Self {
        Self {
            thread_name: "extra-object-finalizer".to_string(),
            stack_size: None,
        }
    }
}

impl FinalizerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.thread_name.is_empty() {
            return Err(SettingsError::EmptyThreadName);
        }
        if self.thread_name.contains('\0') {
            return Err(SettingsError::NulInThreadName);
        }
        match self.stack_size {
            Some(size) if size < MIN_FINALIZER_STACK_SIZE => {
                Err(SettingsError::StackTooSmall(size))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSettings {
    /// Destroy pages that end a sweep with no occupied cell instead of
    /// keeping them for reuse.
    pub release_empty_pages: bool,
    pub finalizer: FinalizerSettings,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            release_empty_pages: true,
            finalizer: FinalizerSettings::default(),
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.finalizer.validate()
    }
}
