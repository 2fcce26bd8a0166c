use std::process::Command;

/// Writes one line per iteration through the host, then returns the count.
const TICKER: &str = r#"
    (module
      (import "wasi_ckpt" "fd_write" (func $write (param i32 i32 i32) (result i32)))
      (memory 1)
      (data (i32.const 0) "tick\n")
      (func (export "run") (param $n i32) (result i32) (local $i i32)
        (block $done
          (loop $l
            (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
            (drop (call $write (i32.const 1) (i32.const 0) (i32.const 5)))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br $l)))
        (local.get $i)))
"#;

fn run(args: &[&str]) -> (String, String) {
    let out = Command::new(env!("CARGO_BIN_EXE_wasm-ckpt-run")).args(args).output().unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    assert!(out.status.success(), "{stderr}");
    (stdout, stderr)
}

#[test]
fn threshold_checkpoints_before_the_nth_host_call() {
    let dir = tempfile::tempdir().unwrap();
    let wat = dir.path().join("ticker.wat");
    std::fs::write(&wat, TICKER).unwrap();
    let wat = wat.to_str().unwrap();
    let image = dir.path().join("ticker.ckpt");
    let image = image.to_str().unwrap();

    let (first, _) = run(&[wat, "--invoke", "run", "--args", "5:i32", "--threshold", "3", "--checkpoint-to", image]);
    assert_eq!(first.matches("tick").count(), 2, "{first}");
    assert!(first.contains("Checkpoint written to"));
    assert!(!first.contains("Result:"));

    // the third call was never made, so it runs after restore
    let (second, _) = run(&[wat, "--restore", image]);
    assert_eq!(second.matches("tick").count(), 3, "{second}");
    assert!(second.contains("[0] 5 (i32)"), "{second}");
}

#[test]
fn without_a_threshold_the_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let wat = dir.path().join("ticker.wat");
    std::fs::write(&wat, TICKER).unwrap();
    let (out, _) = run(&[wat.to_str().unwrap(), "--invoke", "run", "--args", "4:i32"]);
    assert_eq!(out.matches("tick").count(), 4);
    assert!(out.contains("[0] 4 (i32)"));
}
