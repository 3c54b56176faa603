mod connection;
mod track_writer;

pub use connection::{
    from_rtc_description, to_ice_candidate, to_rtc_description, to_rtc_ice_servers,
    PeerNegotiator, PeerNegotiatorFactory, WebRtcTrack,
};
pub use track_writer::{file_stem, FrameSize, TrackRecorder};
