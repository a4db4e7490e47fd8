/// Turns the payload of a freshly appended block into a well-formed empty page.
///
/// The payload excludes the LSN header, so a formatter cannot clobber it.
pub trait PageFormatter: Send + Sync {
    fn format(&self, payload: &mut [u8]);
}

/// Leaves the payload zero-filled.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroFormatter;

impl PageFormatter for ZeroFormatter {
    fn format(&self, payload: &mut [u8]) {
        payload.fill(0);
    }
}

impl<F> PageFormatter for F
where
    F: Fn(&mut [u8]) + Send + Sync,
{
    fn format(&self, payload: &mut [u8]) {
        self(payload)
    }
}
