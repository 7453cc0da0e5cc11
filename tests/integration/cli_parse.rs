use clap::{CommandFactory, Parser};
use kmsorter::tooling::cli::{Cli, Commands};
use std::path::PathBuf;

#[test]
fn parse_valid_command_matrix() {
    let cases: Vec<Vec<&str>> = vec![
        vec!["kmsorter", "load", "image.png"],
        vec!["kmsorter", "load", "--watch", "/srv/incoming"],
        vec!["kmsorter", "load", "--chunk-size", "1024", "dir"],
        vec!["kmsorter", "--debug", "process"],
        vec!["kmsorter", "process", "-c", "#0E96B4"],
        vec!["kmsorter", "sort", "-c", "#0E96B4", "-c", "#FF0000"],
        vec!["kmsorter", "sort", "--color", "00FF00", "--spool-dir", "/tmp/bus"],
        vec!["kmsorter", "--log-format", "json", "--log-output", "stdout", "process"],
    ];

    for args in cases {
        let parsed = Cli::try_parse_from(args.clone());
        assert!(parsed.is_ok(), "expected {:?} to parse: {:?}", args, parsed.err());
    }
}

#[test]
fn parse_invalid_command_matrix() {
    let cases: Vec<Vec<&str>> = vec![
        vec!["kmsorter"],
        vec!["kmsorter", "load"],
        vec!["kmsorter", "sort"],
        vec!["kmsorter", "sort", "-c"],
        vec!["kmsorter", "load", "--chunk-size", "big", "dir"],
        vec!["kmsorter", "unknown"],
    ];

    for args in cases {
        assert!(
            Cli::try_parse_from(args.clone()).is_err(),
            "expected {:?} to be rejected",
            args
        );
    }
}

#[test]
fn load_arguments_are_captured() {
    let cli = Cli::try_parse_from([
        "kmsorter",
        "--store-path",
        "/var/lib/kmsorter/index",
        "load",
        "--chunk-size",
        "2048",
        "photos",
    ])
    .unwrap();
    assert_eq!(cli.store_path, Some(PathBuf::from("/var/lib/kmsorter/index")));
    assert_eq!(
        cli.command,
        Commands::Load {
            watch: false,
            chunk_size: Some(2048),
            path: PathBuf::from("photos"),
        }
    );
}

#[test]
fn command_definition_is_consistent() {
    Cli::command().debug_assert();
}
