//! COM adapter from `IDebugOutputCallbacks` to [`OutputCallbacks`].

use std::sync::Arc;

use windows::core::{implement, PCSTR};
use windows::Win32::System::Diagnostics::Debug::Extensions::{IDebugOutputCallbacks, IDebugOutputCallbacks_Impl};

use crate::output::OutputCallbacks;

#[implement(IDebugOutputCallbacks)]
pub(super) struct OutputBridge
{
    sink: Arc<dyn OutputCallbacks>,
}

impl OutputBridge
{
    pub(super) fn new(sink: Arc<dyn OutputCallbacks>) -> Self
    {
        Self { sink }
    }
}

impl IDebugOutputCallbacks_Impl for OutputBridge
{
    fn Output(&self, mask: u32, text: &PCSTR) -> windows::core::Result<()>
    {
        if text.is_null() {
            return Ok(());
        }
        // SAFETY: the engine passes a NUL-terminated string valid for the call.
        let bytes = unsafe { text.as_bytes() };
        self.sink.output(mask, &String::from_utf8_lossy(bytes));
        Ok(())
    }
}
