use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};
use tonic_build;

const PROTOS: [&str; 3] = ["./protos/raft.proto", "./protos/logapi.proto", "./protos/gossip.proto"];

fn main() -> io::Result<()> {
    for proto in PROTOS.iter() {
        println!("cargo:rerun-if-changed={}", proto);
    }
    build_proto()?;
    Ok(())
}

fn build_proto() -> io::Result<()> {
    idempotent_create_dir("./generated/")?;
    tonic_build::configure()
        .out_dir("./generated/")
        .compile(&PROTOS, &["./protos/"])
}

fn idempotent_create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Ok(()),
            _ => Err(e),
        },
    }
}
