//! Generated gRPC types for the daemon's control-plane surface.

pub mod daemon {
    tonic::include_proto!("supsrc.daemon");
}
