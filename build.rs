fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tell cargo to rerun this if the proto files change
    println!("cargo:rerun-if-changed=proto/registration.proto");
    println!("cargo:rerun-if-changed=proto/module.proto");

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the proto files
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/registration.proto", "proto/module.proto"],
            &["proto"],
        )?;

    Ok(())
}
