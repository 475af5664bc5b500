fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(
            &["proto/common.proto", "proto/master.proto", "proto/volume.proto"],
            &["proto"],
        )?;
    Ok(())
}
