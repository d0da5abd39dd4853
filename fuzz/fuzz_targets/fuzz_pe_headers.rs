#![no_main]

use libfuzzer_sys::fuzz_target;
use pe_unwind::{ImageInfo, ImageView};

fuzz_target!(|data: &[u8]| {
    // Header parsing must reject garbage with an error, never a panic.
    let _ = ImageInfo::from_headers(&ImageView::new(data));
});
