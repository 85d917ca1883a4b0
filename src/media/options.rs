use std::collections::BTreeMap;

use ffmpeg_next::Dictionary;
use ffmpeg_next::ffi::AVDictionary;

use super::error::{MediaError, Result};

/// Owned option dictionary handed to a native open call.
///
/// Native open functions remove every option they recognise and leave the
/// rest behind, so after [`Options::apply`] the dictionary holds exactly the
/// options nobody consumed.
pub struct Options {
    dict: Dictionary<'static>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dict: Dictionary::new(),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut options = Self::new();
        for (key, value) in map {
            options.set(key, value);
        }
        options
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.dict.set(key, value);
    }

    /// Sets `key` only when the user has not provided it.
    pub fn set_default(&mut self, key: &str, value: &str) {
        if self.dict.get(key).is_none() {
            self.dict.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.dict.iter().map(|(key, _)| key.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.iter().next().is_none()
    }

    /// Lends the raw dictionary to `f` and takes back whatever is left in it.
    pub(crate) fn apply<R>(&mut self, f: impl FnOnce(*mut *mut AVDictionary) -> R) -> R {
        let taken = std::mem::replace(&mut self.dict, Dictionary::new());
        // SAFETY: ownership of the dictionary moves into `raw` and is restored
        // from the (possibly reallocated) pointer the native call leaves behind.
        unsafe {
            let mut raw = taken.disown();
            let result = f(&mut raw);
            self.dict = Dictionary::own(raw);
            result
        }
    }

    /// Fails when any option survived the native open call.
    pub fn ensure_consumed(&self, scope: &'static str) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        Err(MediaError::UnsupportedOptions {
            scope,
            keys: self.keys(),
        })
    }
}
