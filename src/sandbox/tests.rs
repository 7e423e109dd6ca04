use super::*;

#[test]
fn render_plain_output() {
    let out = ExecOutput {
        stdout: "hello\n".to_string(),
        ..Default::default()
    };
    assert_eq!(out.render(), "hello\n");
}

#[test]
fn render_appends_exit_code_when_nonzero() {
    let out = ExecOutput {
        stdout: "partial".to_string(),
        stderr: "boom".to_string(),
        exit_code: 2,
        ..Default::default()
    };
    let rendered = out.render();
    assert!(rendered.contains("partial"));
    assert!(rendered.contains("[STDERR]:\nboom"));
    assert!(rendered.ends_with("[Exit Code: 2]"));
}

#[test]
fn render_marks_truncation_and_timeout() {
    let out = ExecOutput {
        stdout: "x".to_string(),
        exit_code: TIMEOUT_EXIT_CODE,
        truncated: true,
        timed_out: true,
        ..Default::default()
    };
    let rendered = out.render();
    assert!(rendered.contains("[output truncated]"));
    assert!(rendered.contains("[killed: timeout]"));
    assert!(rendered.contains(&format!("[Exit Code: {}]", TIMEOUT_EXIT_CODE)));
}

#[test]
fn render_empty_output_placeholder() {
    let out = ExecOutput::default();
    assert_eq!(out.render(), "(no output)");
}

#[test]
fn whitespace_only_stderr_is_dropped() {
    let out = ExecOutput {
        stdout: "ok".to_string(),
        stderr: "  \n".to_string(),
        ..Default::default()
    };
    assert_eq!(out.render(), "ok");
}
