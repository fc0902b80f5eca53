use anyhow::Context;
use common::env::config_service;
use server::ServerOptions;

fn usage() -> ! {
    eprintln!("Usage: sealkv-server -port:<N> [-server-in-loop]");
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    config_service();

    let mut port = None;
    let mut server_in_loop = false;
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("-port:") {
            port = Some(
                value
                    .parse::<u16>()
                    .with_context(|| format!("invalid port {value:?}"))?,
            );
        } else if arg == "-server-in-loop" {
            server_in_loop = true;
        } else {
            eprintln!("Unknown argument: {arg}");
            usage();
        }
    }
    let Some(port) = port else { usage() };

    tracing::info!("Starting server on port {port}");
    server::run_server(ServerOptions {
        port,
        server_in_loop,
    })
}
