use serde::Serialize;

use crate::client::{Client, ClientError};

pub const MUTATE_VERB: &str = "MUTATE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationTarget {
    Retries,
    Scheduled,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationCommand {
    Clear,
    Kill,
    Discard,
    Requeue,
}

/// Narrows a mutation. The server ignores every filter for `clear`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MutationFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jids: Option<Vec<String>>,
    /// Redis SCAN-style pattern, e.g. `*uid:12345*`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MutationRequest {
    pub cmd: MutationCommand,
    pub target: MutationTarget,
    pub filter: MutationFilter,
}

/// Administrative bulk operation against one of the server's job sets.
///
/// Obtained from [`Client::retries`], [`Client::scheduled`] or
/// [`Client::dead`]; the terminal verb sends `MUTATE` and expects `OK`.
pub struct Mutation<'a> {
    client: &'a Client,
    target: MutationTarget,
    filter: MutationFilter,
}

impl<'a> Mutation<'a> {
    pub fn new(client: &'a Client, target: MutationTarget) -> Self {
        Self {
            client,
            target,
            filter: MutationFilter::default(),
        }
    }

    pub fn of_type(mut self, jobtype: impl Into<String>) -> Self {
        self.filter.jobtype = Some(jobtype.into());
        self
    }

    pub fn with_jids<I, S>(mut self, jids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.jids = Some(jids.into_iter().map(Into::into).collect());
        self
    }

    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.filter.regexp = Some(pattern.into());
        self
    }

    pub fn request(&self, cmd: MutationCommand) -> MutationRequest {
        MutationRequest {
            cmd,
            target: self.target,
            filter: self.filter.clone(),
        }
    }

    pub fn clear(self) -> Result<(), ClientError> {
        self.send(MutationCommand::Clear)
    }

    pub fn kill(self) -> Result<(), ClientError> {
        self.send(MutationCommand::Kill)
    }

    pub fn discard(self) -> Result<(), ClientError> {
        self.send(MutationCommand::Discard)
    }

    pub fn requeue(self) -> Result<(), ClientError> {
        self.send(MutationCommand::Requeue)
    }

    fn send(self, cmd: MutationCommand) -> Result<(), ClientError> {
        self.client.mutate(&self.request(cmd))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::client::{Client, ClientOptions};
    use crate::logging::Logger;
    use crate::testing::MockServer;

    use super::MutationCommand;

    fn client_for(server: &MockServer) -> Client {
        Client::new(
            ClientOptions::for_address("127.0.0.1", server.port()),
            Logger::disabled(),
        )
        .expect("client should build")
    }

    #[test]
    fn request_serializes_only_given_filters() {
        let server = MockServer::start();
        let client = client_for(&server);

        let request = client
            .retries()
            .of_type("SendEmail")
            .request(MutationCommand::Kill);

        assert_eq!(
            serde_json::to_value(&request).expect("request serializes"),
            json!({"cmd":"kill","target":"retries","filter":{"jobtype":"SendEmail"}})
        );
    }

    #[test]
    fn requeue_sends_mutate_with_all_filters() {
        let server = MockServer::start();
        let client = client_for(&server);

        client
            .dead()
            .with_jids(["123", "456"])
            .matching("*uid:12345*")
            .requeue()
            .expect("mutation should succeed");

        let sent = server.commands("MUTATE");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].json(),
            json!({
                "cmd": "requeue",
                "target": "dead",
                "filter": {"jids": ["123", "456"], "regexp": "*uid:12345*"}
            })
        );
        client.close();
    }

    #[test]
    fn clear_on_scheduled_set() {
        let server = MockServer::start();
        let client = client_for(&server);

        client.scheduled().clear().expect("clear should succeed");

        assert!(server.wait_for_command("MUTATE", Duration::from_secs(1)));
        assert_eq!(
            server.commands("MUTATE")[0].json(),
            json!({"cmd":"clear","target":"scheduled","filter":{}})
        );
    }

    #[test]
    fn non_ok_reply_is_an_error() {
        let server = MockServer::builder()
            .reply("MUTATE", |_| "-ERR unknown target\r\n".to_owned())
            .spawn();
        let client = client_for(&server);

        assert!(client.retries().discard().is_err());
    }
}
