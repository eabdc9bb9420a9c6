fn main() {
    let proto_dir = "../../proto"; // relative from crate dir
    let mut protos = Vec::new();
    for entry in walkdir::WalkDir::new(proto_dir) {
        let e = entry.expect("walk proto dir");
        if e.path().extension().and_then(|s| s.to_str()) == Some("proto") {
            protos.push(e.path().to_string_lossy().to_string());
        }
    }
    println!("cargo:rerun-if-changed={proto_dir}");
    // Stable ordering for hashing
    protos.sort();
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for p in &protos {
        hasher.update(std::fs::read(p).expect("read proto"));
    }
    println!("cargo:rustc-env=PROTO_SCHEMA_VERSION={:x}", hasher.finalize());

    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc");
        std::env::set_var("PROTOC", protoc);
    }
    let mut prost_config = prost_build::Config::new();
    // Model payloads decode straight into `bytes::Bytes`.
    prost_config.bytes(["."]);
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_with_config(prost_config, &protos, &[proto_dir])
        .expect("failed to compile protos");
}
