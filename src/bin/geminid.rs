use std::path::PathBuf;
use clap::Parser;
use gemini::{listen_and_serve, trap_panic, Protocol, Request, ResponseWriter, ServerOptions, Status};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "geminid")]
#[command(about = "Demo Gemini and Titan server", long_about = None)]
struct Cli {
    /// Listen on host and port, e.g. hostname:1965
    #[arg(long, default_value = "127.0.0.1:1965")]
    host: String,

    /// Certificate file
    #[arg(long, default_value = "server.crt.pem")]
    cert: PathBuf,

    /// Private key associated with the certificate file
    #[arg(long, default_value = "server.key.pem")]
    key: PathBuf,
}

fn serve(w: &mut dyn ResponseWriter, r: &Request) {
    tracing::info!(path = %r.target.path, user = r.user_name().join(" ").as_str(), "request");

    let result = match r.target.path.as_str() {
        "/" => w.write_status(Status::Success, "text/gemini").and_then(|_| w.write_body(b"Hello, world!").map(drop)),
        "/user" if r.certificate().is_none() => w.write_status(Status::CertificateRequired, "Authentication Required"),
        "/user" => {
            let user = r.user_name();
            w.write_status(Status::Success, "text/gemini")
                .and_then(|_| w.write_body(user[0].as_bytes()).map(drop))
        }
        "/die" => panic!("must die"),
        "/post" if r.protocol() != Some(Protocol::Titan) => w
            .write_status(Status::Success, "text/gemini")
            .and_then(|_| w.write_body(b"Use titan scheme to upload data").map(drop)),
        "/post" => {
            let payload = match r.read_titan_payload() {
                Ok(payload) => payload,
                Err(e) => panic!("failed to read payload: {}", e),
            };
            let titan = r.titan.clone().unwrap_or_default();
            let summary = format!(
                "Titan Upload Parameters\r\nUpload MIME Type: {}\r\nToken: {}\r\nSize: {}\r\nPayload:\r\n",
                titan.mime, titan.token, titan.size
            );
            w.write_status(Status::Success, "text/gemini")
                .and_then(|_| w.write_body(summary.as_bytes()))
                .and_then(|_| w.write_body(&payload).map(drop))
        }
        path => w.write_status(Status::NotFound, path),
    };

    if let Err(e) = result {
        panic!("failed to write response: {}", e);
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gemini=info,geminid=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = ServerOptions { address: cli.host, certificate: cli.cert, key: cli.key };

    if let Err(e) = listen_and_serve(&options, trap_panic(serve)) {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
