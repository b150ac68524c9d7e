use bitflags::bitflags;
use libc::c_uint;
use rsmpeg::ffi;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AvCodecFlags: c_uint {
        const GLOBAL_HEADER = ffi::AV_CODEC_FLAG_GLOBAL_HEADER;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AvFormatFlags: c_uint {
        const GLOBAL_HEADER = ffi::AVFMT_GLOBALHEADER;
    }
}
