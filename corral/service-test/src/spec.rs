use serde::Deserialize;

/// One command in a test sequence: what to run, what to feed it on stdin,
/// what its stdout should equal, and how long to wait after spawning it
/// before moving on to the next command.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, rename = "sleepMs")]
    pub sleep_ms: Option<u64>,
}

/// A full test sequence, as parsed from the harness's YAML fixture: a list
/// of commands where every entry but the last is backgrounded as a server
/// and the last is run as the client.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Spec {
    pub commands: Vec<CommandSpec>,
}

impl Spec {
    pub fn parse_yaml(yaml: &str) -> Result<Self, corral2_error::Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            corral2_error::Error::with_cause(corral2_error::Kind::BadRequest, "invalid service-test fixture", e)
        })
    }

    /// The client is the last command in the sequence; every earlier
    /// command is a backgrounded server. `None` for an empty spec.
    pub fn client(&self) -> Option<&CommandSpec> {
        self.commands.last()
    }

    pub fn servers(&self) -> &[CommandSpec] {
        match self.commands.len() {
            0 => &[],
            n => &self.commands[..n - 1],
        }
    }
}

impl CommandSpec {
    /// Splits `command` into a program and its arguments on whitespace.
    /// No shell quoting support -- fixtures that need quoted arguments
    /// should pass them pre-split via a wrapper script instead.
    pub fn argv(&self) -> Vec<&str> {
        self.command.split_whitespace().collect()
    }
}
