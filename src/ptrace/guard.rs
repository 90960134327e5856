//! Scoped attach helper.

use std::ops::{Deref, DerefMut};

use super::ProcessController;
use crate::error::Result;

/// Attaches on construction iff the controller is not already attached, and
/// detaches on drop only in that case. Lets callers compose operations that
/// need the target stopped without tracking attach state themselves.
pub struct AttachGuard<'a> {
    controller: &'a mut ProcessController,
    acquired: bool,
}

impl<'a> AttachGuard<'a> {
    pub fn new(controller: &'a mut ProcessController) -> Result<Self> {
        let acquired = if controller.is_attached() {
            false
        } else {
            controller.attach()?;
            true
        };
        Ok(Self {
            controller,
            acquired,
        })
    }

    /// Whether this guard performed the attach (and will detach on drop).
    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Deref for AttachGuard<'_> {
    type Target = ProcessController;

    fn deref(&self) -> &ProcessController {
        self.controller
    }
}

impl DerefMut for AttachGuard<'_> {
    fn deref_mut(&mut self) -> &mut ProcessController {
        self.controller
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            if let Err(e) = self.controller.detach() {
                log::error!("detach on scope exit failed: {}", e);
            }
        }
    }
}
