fn main() {
    // Messages are hand-written prost types in src/distributed/service.rs, so
    // the service is described here instead of in a .proto file.
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::distributed::service::{input}"))
            .output_type(format!("crate::distributed::service::{output}"))
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let collective = tonic_build::manual::Service::builder()
        .name("Collective")
        .package("batch_core.collective")
        .method(method("join", "Join", "JoinRequest", "JoinReply"))
        .method(method("gather", "Gather", "GatherRequest", "GatherReply"))
        .method(method(
            "broadcast",
            "Broadcast",
            "BroadcastRequest",
            "BroadcastReply",
        ))
        .build();

    println!("cargo:rerun-if-changed=build.rs");

    tonic_build::manual::Builder::new()
        .build_server(true)
        .build_client(true)
        .compile(&[collective]);
}
