/// Background services: ingest supervisors, recorder, upload worker and
/// the RTSP server child, coordinated through the shared bridge state.
pub mod ingest;
pub mod manager;
pub mod recorder;
pub mod rtsp;
pub mod upload;
