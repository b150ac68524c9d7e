use std::collections::HashMap;
use std::ffi::CString;

use rsmpeg::avutil::AVDictionary;

/// A wrapper type for ffmpeg option maps, passed to capture devices and
/// encoders. Keys keep their insertion order so dumps stay readable.
#[derive(Debug, Clone, Default)]
pub struct Options(Vec<(String, String)>);

impl Options {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set an option, replacing any previous value for the same key.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.0.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates options for an X11-style screen grab: capture region size,
    /// grab framerate and the on-screen region outline.
    pub fn preset_x11grab(width: i32, height: i32, framerate: i32) -> Self {
        let mut opts = Self::new();
        opts.set("video_size", &format!("{}x{}", width, height));
        opts.set("framerate", &framerate.to_string());
        opts.set("show_region", "1");
        opts
    }

    /// Creates options for an AVFoundation-style capture source, which
    /// delivers video and audio from one device and can draw the cursor.
    pub fn preset_avfoundation(framerate: i32) -> Self {
        let mut opts = Self::new();
        opts.set("framerate", &framerate.to_string());
        opts.set("capture_cursor", "1");
        opts
    }

    /// Options for an H264 encoder tuned for real-time capture. The encoder
    /// must keep up with the grab rate, so speed wins over compression.
    pub fn preset_h264_realtime() -> Self {
        let mut opts = Self::new();
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        opts
    }

    /// Convert to an ffmpeg-native dictionary for APIs that consume one.
    pub(crate) fn to_avdict(&self) -> Option<AVDictionary> {
        let mut dict: Option<AVDictionary> = None;
        for (key, value) in self.iter() {
            let key = CString::new(key).expect("option key contains NUL");
            let value = CString::new(value).expect("option value contains NUL");
            dict = Some(match dict {
                None => AVDictionary::new(&key, &value, 0),
                Some(dict) => dict.set(&key, &value, 0),
            });
        }
        dict
    }
}

impl From<HashMap<String, String>> for Options {
    fn from(item: HashMap<String, String>) -> Self {
        let mut opts = Self::new();
        for (k, v) in item {
            opts.set(&k, &v);
        }
        opts
    }
}

impl From<Options> for HashMap<String, String> {
    fn from(item: Options) -> Self {
        item.0.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_key() {
        let mut opts = Options::new();
        opts.set("framerate", "30");
        opts.set("framerate", "60");
        assert_eq!(opts.get("framerate"), Some("60"));
        assert_eq!(opts.iter().count(), 1);
    }

    #[test]
    fn x11grab_preset_carries_region_options() {
        let opts = Options::preset_x11grab(1280, 720, 30);
        assert_eq!(opts.get("video_size"), Some("1280x720"));
        assert_eq!(opts.get("framerate"), Some("30"));
        assert_eq!(opts.get("show_region"), Some("1"));
    }

    #[test]
    fn realtime_preset_prefers_speed() {
        let opts = Options::preset_h264_realtime();
        assert_eq!(opts.get("preset"), Some("ultrafast"));
        assert_eq!(opts.get("tune"), Some("zerolatency"));
    }
}
