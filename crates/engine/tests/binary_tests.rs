use std::io::Write as _;
use std::process::{Command, Output, Stdio};

fn sample_config() -> String {
    format!("{}/../../config/blockgate.yaml", env!("CARGO_MANIFEST_DIR"))
}

fn run(input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_blockgate"))
        .arg(sample_config())
        .env("BLOCKGATE_LOG_FORMAT", "text")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    child.wait_with_output().unwrap()
}

fn decisions(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8(output.stdout.clone())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

const VALID: &str = r#"{"method":"GET","url":"/","source_ip":"192.0.2.10"}"#;

#[test]
fn unparseable_line_is_answered_with_a_block() {
    let input = format!("{}\n{{not json\n{}\n", VALID, VALID);
    let output = run(input.as_bytes());
    assert!(output.status.success());

    let decisions = decisions(&output);
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[0]["action"], "allow");
    assert_eq!(decisions[1]["action"], "block");
    assert_eq!(decisions[1]["matched_check"], "malformed_input");
    assert_eq!(decisions[2]["action"], "allow");
}

#[test]
fn invalid_utf8_does_not_stop_the_stream() {
    let mut input = Vec::new();
    input.extend_from_slice(VALID.as_bytes());
    input.extend_from_slice(b"\n\xff\xfe\n");
    input.extend_from_slice(VALID.as_bytes());
    input.push(b'\n');

    let output = run(&input);
    assert!(output.status.success());

    let decisions = decisions(&output);
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[1]["matched_check"], "malformed_input");
    assert_eq!(decisions[2]["action"], "allow");
}

#[test]
fn blank_lines_produce_no_output() {
    let input = format!("\n{}\n   \n", VALID);
    let output = run(input.as_bytes());
    assert!(output.status.success());
    assert_eq!(decisions(&output).len(), 1);
}
