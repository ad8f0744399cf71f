use std::sync::Arc;

use smtp::{handler::HookResult, server::session::SessionState, Config, Envelope, Handler, Server};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, Certificate, PrivateKey};
use tracing::{error, info};

use self::listener::MultiListener;

mod listener;

struct AcceptAll;

#[async_trait::async_trait]
impl auth::Authenticator for AcceptAll {
    async fn authenticate(
        &self,
        _mechanism: &str,
        credentials: &auth::Credentials,
    ) -> auth::Verdict {
        match credentials {
            auth::Credentials::Password { username, .. } => {
                auth::Verdict::Accept(Box::new(username.clone()))
            }
            auth::Credentials::Raw(_) => auth::Verdict::reject(),
        }
    }
}

/// Accepts everything and logs what it saw.
struct Debugging;

#[async_trait::async_trait]
impl Handler for Debugging {
    async fn data(&self, session: &mut SessionState, envelope: &mut Envelope) -> HookResult {
        info!(
            peer = %session.peer,
            from = ?envelope.mail_from,
            recipients = ?envelope.rcpt_tos,
            "message received"
        );
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cert = rcgen::generate_simple_self_signed(["localhost".to_owned()])?;
    let tls = Arc::new(
        rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![Certificate(cert.serialize_der()?)],
                PrivateKey(cert.serialize_private_key_der()),
            )?,
    );

    let server = Server::new(
        Config {
            hostname: "localhost".to_owned(),
            tls: Some(tls.clone()),
            authenticator: Some(Arc::new(AcceptAll)),
            ..Config::default()
        },
        Debugging,
    );

    let listener = MultiListener::new("0.0.0.0:2525")
        .await?
        .with_tls("0.0.0.0:4465", tls)
        .await?;

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Got connection from: {addr}");

        let session = server.accept::<TcpStream>(stream, addr.to_string());
        tokio::spawn(async move {
            if let Err(e) = session.serve().await {
                error!("session error: {e:?}");
            }
        });
    }
}
