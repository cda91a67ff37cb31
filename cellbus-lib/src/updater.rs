//! Firmware update over the bus.
//!
//! The master sends every page in order and repeats a page when it sees a
//! non-zero byte after it; modules signal a CRC error with a single zero bit,
//! which the master's UART reads as 0xFF. Four padding pages follow the last
//! real page so it still gets a retry.

use crate::blocks::PageBuffer;
use crate::constants::{PAGE_BYTES, PAGE_FRAME_SIZE, UPDATE_TRAILING_PAGES};
use crate::error::{BusError, BusResult};
use crate::module::ModuleHal;
use tracing::{debug, warn};

/// Module side result of one received page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Written(u8),
    /// Duplicate, out of order or padding page
    Ignored,
    CrcError,
    /// The last missing page was written
    Complete,
}

/// Module side page receiver
#[derive(Debug, Clone)]
pub struct Updater {
    expected: u8,
    max_pages: u8,
}

impl Updater {
    pub fn new(max_pages: u8) -> Self {
        Self { expected: 0, max_pages }
    }

    /// Next page the module is waiting for
    pub fn expected_page(&self) -> u8 {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.expected >= self.max_pages
    }

    pub fn handle_frame<H: ModuleHal>(&mut self, frame: &[u8], hal: &mut H) -> PageOutcome {
        if frame.len() != PAGE_FRAME_SIZE || frame[0] >= self.max_pages {
            return PageOutcome::Ignored;
        }

        let page = match PageBuffer::parse(frame) {
            Ok(page) => page,
            Err(BusError::CrcMismatch { expected, actual }) => {
                warn!(
                    "Page {} CRC mismatch: carries 0x{:04X}, computed 0x{:04X}",
                    frame[0], expected, actual
                );
                return PageOutcome::CrcError;
            }
            Err(_) => return PageOutcome::Ignored,
        };

        if page.page != self.expected {
            debug!("Ignoring page {}, waiting for {}", page.page, self.expected);
            return PageOutcome::Ignored;
        }

        hal.write_page(page.page, &page.data);
        self.expected += 1;
        if self.is_complete() {
            PageOutcome::Complete
        } else {
            PageOutcome::Written(page.page)
        }
    }
}

/// Master side firmware image, padded with erased flash bytes
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    max_pages: u8,
}

impl FirmwareImage {
    pub fn new(image: &[u8], max_pages: u8) -> BusResult<Self> {
        let max = max_pages as usize * PAGE_BYTES;
        if image.len() > max {
            return Err(BusError::FirmwareTooLarge {
                size: image.len(),
                max,
            });
        }
        let mut data = image.to_vec();
        data.resize(max, 0xFF);
        Ok(Self { data, max_pages })
    }

    pub fn max_pages(&self) -> u8 {
        self.max_pages
    }

    /// Pages sent in one update run, padding included
    pub fn total_pages(&self) -> u8 {
        self.max_pages + UPDATE_TRAILING_PAGES
    }

    /// Page `n`; padding pages read as erased flash
    pub fn page(&self, n: u8) -> PageBuffer {
        let mut data = [0xFF; PAGE_BYTES];
        let start = n as usize * PAGE_BYTES;
        if let Some(chunk) = self.data.get(start..start + PAGE_BYTES) {
            data.copy_from_slice(chunk);
        }
        PageBuffer::new(n, data)
    }
}
