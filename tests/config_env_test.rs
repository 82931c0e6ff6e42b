// Kept in its own test binary: it mutates process environment variables.
use clap::Parser;
use qwq_serve::ServeArgs;

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    serve: ServeArgs,
}

#[test]
fn test_port_and_host_from_environment() {
    std::env::set_var("PORT", "9123");
    std::env::set_var("HOST", "127.0.0.1");

    let from_env = TestCli::try_parse_from(["qwq-serve"]).unwrap().serve;
    let config = from_env.into_config().unwrap();
    assert_eq!(config.addr.to_string(), "127.0.0.1:9123");

    let overridden = TestCli::try_parse_from(["qwq-serve", "--port", "9124"])
        .unwrap()
        .serve;
    assert_eq!(overridden.port, 9124);

    std::env::remove_var("PORT");
    std::env::remove_var("HOST");
}
