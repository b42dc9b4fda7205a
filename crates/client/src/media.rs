use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::SessionError;

/// What to capture. Mirrors the browser getUserMedia constraints we care
/// about.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            width: 1280,
            height: 720,
            framerate: 30,
        }
    }
}

/// Handle to acquired local capture tracks. Clones share the underlying
/// tracks; `stop` releases them for every clone.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

struct LocalMediaInner {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                tracks,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.inner.tracks
    }

    /// Release the capture. Idempotent; sample writers should check
    /// `is_stopped` and stop pumping.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!(tracks = self.inner.tracks.len(), "Local media stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same acquisition.
    pub fn same_handle(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.inner.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Opens local capture devices. Implementations may block on device setup;
/// the session runs `open` on a blocking thread.
pub trait MediaSource: Send + Sync {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError>;
}

/// Default source backed by sample-fed RTP tracks (H.264 video, Opus audio).
/// The application pumps encoded samples into the returned tracks via
/// `write_sample`; this source only allocates them.
#[derive(Debug, Default)]
pub struct SampleTrackSource;

impl MediaSource for SampleTrackSource {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, SessionError> {
        if !constraints.video && !constraints.audio {
            return Err(SessionError::MediaAccess(
                "constraints request neither video nor audio".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90_000,
                    ..Default::default()
                },
                "video".to_string(),
                "wavecast".to_string(),
            )));
        }
        if constraints.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48_000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                "wavecast".to_string(),
            )));
        }
        Ok(LocalMedia::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_source_respects_constraints() {
        let source = SampleTrackSource;
        let both = source.open(&MediaConstraints::default()).unwrap();
        assert_eq!(both.tracks().len(), 2);

        let video_only = source
            .open(&MediaConstraints {
                audio: false,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(video_only.tracks().len(), 1);

        let neither = source.open(&MediaConstraints {
            video: false,
            audio: false,
            ..Default::default()
        });
        assert!(matches!(neither, Err(SessionError::MediaAccess(_))));
    }

    #[test]
    fn stop_is_shared_across_clones_and_idempotent() {
        let media = SampleTrackSource.open(&MediaConstraints::default()).unwrap();
        let clone = media.clone();
        assert!(!clone.is_stopped());
        media.stop();
        media.stop();
        assert!(clone.is_stopped());
        assert!(media.same_handle(&clone));
    }
}
