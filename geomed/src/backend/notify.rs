//! Notification listener.
//!
//! Holds a dedicated connection in LISTEN mode and forwards
//! notifications to the daemon loop. The connection never carries
//! loader traffic.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{error, info, warn};

use super::Error;
use crate::config::Database;
use crate::util::escape_identifier;

pub struct Listener {
    // LISTEN lives as long as this client.
    _client: tokio_postgres::Client,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl Listener {
    /// Connect and subscribe to the channel.
    pub async fn connect(database: &Database, channel: &str) -> Result<Self, Error> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&database.host)
            .port(database.port)
            .dbname(&database.name)
            .user(&database.user)
            .password(&database.password);

        let (client, mut connection) = config.connect(NoTls).await?;
        let (tx, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut messages =
                futures::stream::poll_fn(move |context| connection.poll_message(context));

            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(_) => (),
                    Err(err) => {
                        error!("listener connection error: {}", err);
                        break;
                    }
                }
            }

            warn!("notification stream closed");
        });

        client
            .batch_execute(&format!("LISTEN \"{}\"", escape_identifier(channel)))
            .await?;
        info!("listening on channel \"{}\"", channel);

        Ok(Self {
            _client: client,
            receiver,
        })
    }

    /// Next notification, or `None` when the connection is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }
}
