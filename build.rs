use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Build metadata surfaced by `mesh-federation-operator version`
    let build_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", build_date);

    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_SHA={}", git_sha);

    let rust_version = Command::new(std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into()))
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=RUST_VERSION={}", rust_version);

    // The discovery messages are plain prost structs in src/discovery/proto.rs,
    // so the service is described manually instead of compiling a .proto file.
    let discover = tonic_build::manual::Method::builder()
        .name("discover")
        .route_name("Discover")
        .input_type("crate::discovery::proto::DiscoveryRequest")
        .output_type("crate::discovery::proto::ServiceList")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("ServiceDiscovery")
        .package("mm.federation.v1")
        .method(discover)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
