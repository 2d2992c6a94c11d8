use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn help_lists_flags_and_check_subcommand() {
    let mut cmd = cargo_bin_cmd!("qbrouter");
    let output = cmd.arg("--help").assert().success().get_output().stdout.clone();
    let help = String::from_utf8(output).expect("utf8 help");

    for flag in [
        "--src",
        "--dest",
        "--src-url",
        "--dest-url",
        "--min-space",
        "--min-seeding-time",
        "--sleep",
        "--dry-run",
        "--config",
    ] {
        assert!(help.contains(flag), "help output is missing {flag}");
    }
    assert!(help.contains("check"));
}

#[test]
fn rejects_unparseable_sleep() {
    let mut cmd = cargo_bin_cmd!("qbrouter");
    cmd.args(["--sleep", "whenever"]).assert().failure();
}
