#![cfg(target_os = "linux")]

use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use test_log::test;

use dex2oat_wrapper::relay::{self, Request};
use dex2oat_wrapper::Error;

use crate::common::supervisor::{spawn_supervisor, Reply};

mod common;

fn file_with(contents: &[u8]) -> File {
    let path = std::env::temp_dir().join(format!(
        "dex2oat-wrapper-relay-{}-{}",
        std::process::id(),
        contents.len()
    ));
    let mut file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();
    file.write_all(contents).unwrap();
    file
}

#[test]
fn descriptor_is_fetched() {
    let (name, supervisor) = spawn_supervisor(vec![Reply::Descriptor(file_with(b"compiler"))]);

    let fd = relay::request_descriptor(&name, Request::hook_library())
        .unwrap()
        .expect("supervisor sent a descriptor");

    let mut received = File::from(fd);
    received.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    received.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "compiler");
    assert_eq!(supervisor.join().unwrap(), [Request::hook_library().code()]);
}

#[test]
fn answer_without_descriptor_is_none() {
    let (name, supervisor) = spawn_supervisor(vec![Reply::Nothing]);

    let request = Request::compiler("dex2oatd".as_ref());
    let fd = relay::request_descriptor(&name, request).unwrap();

    assert!(fd.is_none());
    assert_eq!(supervisor.join().unwrap(), [request.code()]);
}

#[test]
fn missing_supervisor_fails_to_connect() {
    let err =
        relay::request_descriptor("dex2oat-wrapper-test-nobody-listens", Request::hook_library())
            .unwrap_err();
    assert!(matches!(err, Error::Connect(..)), "{err}");
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn run_without_compiler_exits_with_3() {
    let (name, supervisor) = spawn_supervisor(vec![Reply::Nothing]);
    let args = vec![OsString::from("/system/bin/dex2oat64"), OsString::from("--foo")];

    let err = match relay::run(&name, args) {
        Ok(never) => match never {},
        Err(err) => err,
    };

    assert!(matches!(err, Error::MissingDescriptor(_)), "{err}");
    assert_eq!(err.exit_code(), 3);
    // Only the compiler was asked for.
    assert_eq!(supervisor.join().unwrap().len(), 1);
}

#[test]
fn run_without_hook_library_still_executes_compiler() {
    let (name, supervisor) = spawn_supervisor(vec![
        Reply::Descriptor(file_with(b"dex2oat binary")),
        Reply::Nothing,
    ]);
    let argv0 = OsString::from("/system/bin/dex2oat64");
    let compiler = Request::compiler(&argv0);

    let err = match relay::run(&name, vec![argv0, OsString::from("--foo")]) {
        Ok(never) => match never {},
        Err(err) => err,
    };

    // The linker does not exist on the host, so reaching `execve` is as far as it gets.
    assert!(matches!(err, Error::Exec(..)), "{err}");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(
        supervisor.join().unwrap(),
        [compiler.code(), Request::hook_library().code()]
    );
}
