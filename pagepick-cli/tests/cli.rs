use assert_cmd::Command;

#[test]
fn help_lists_the_selection_flags() {
    let assert = Command::cargo_bin("pagepick").unwrap().arg("--help").assert();
    let output = assert.success().get_output().stdout.clone();
    let help = String::from_utf8(output).unwrap();
    assert!(help.contains("--start"));
    assert!(help.contains("--end"));
    assert!(help.contains("--endpoint"));
}

#[test]
fn missing_file_argument_is_rejected() {
    Command::cargo_bin("pagepick").unwrap().assert().failure();
}
