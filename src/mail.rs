//! Out-of-band delivery of one-time codes.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;
use crate::error::{Result, ServerError};

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

/// Mail templates list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Deliver a one-time verification code.
    MfaCode,
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: Cow<'a, str>,
    template: Template,
    /// One-time code rendered into the template.
    code: Cow<'a, str>,
}

/// Mail queue publisher.
///
/// Without a configured broker the manager logs the event and reports
/// success, which keeps development setups working; deployments configure
/// the queue so delivery failures become [`ServerError::DeliveryFailed`]
/// and the caller can discard the stranded code.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    conn: Option<Arc<Connection>>,
    #[cfg(test)]
    sink: Option<Arc<dashmap::DashMap<String, String>>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme()).map_err(|err| {
                ServerError::Configuration(format!(
                    "invalid AMQP scheme: {err}"
                ))
            })?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config = ConnectionProperties::default()
            .with_connection_name("authgate_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config)
            .await
            .map_err(|_| ServerError::DeliveryFailed)?;

        tracing::info!(%addr, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            conn: Some(Arc::new(conn)),
            #[cfg(test)]
            sink: None,
        })
    }

    /// Capture deliveries in memory instead of publishing.
    #[cfg(test)]
    pub fn sink() -> (Self, Arc<dashmap::DashMap<String, String>>) {
        let deliveries = Arc::new(dashmap::DashMap::new());
        (
            Self {
                queue: String::default(),
                conn: None,
                sink: Some(Arc::clone(&deliveries)),
            },
            deliveries,
        )
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel> {
        let channel = conn
            .create_channel()
            .await
            .map_err(|_| ServerError::DeliveryFailed)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|_| ServerError::DeliveryFailed)?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.authgate.email",
            source: "com.authgate",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }

    /// Deliver a one-time `code` to `email`.
    pub async fn send_code(&self, email: &str, code: &str) -> Result<()> {
        #[cfg(test)]
        if let Some(sink) = &self.sink {
            if email.ends_with("@unreachable.test") {
                return Err(ServerError::DeliveryFailed);
            }
            sink.insert(email.to_owned(), code.to_owned());
            return Ok(());
        }

        let Some(conn) = &self.conn else {
            tracing::warn!(%email, "no mail broker configured, code not delivered");
            return Ok(());
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let content = Content {
            to: Cow::from(email),
            template: Template::MfaCode,
            code: Cow::from(code),
        };
        let payload = Self::create_event(content);
        let payload = serde_json::to_string(&payload)?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(|_| ServerError::DeliveryFailed)?;

        tracing::trace!(%email, "mfa code event sent");

        Ok(())
    }
}
