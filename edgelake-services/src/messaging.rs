use edgelake_core::{naming::MessagingConfig, Error, Result};
use regex::Regex;

#[derive(Debug)]
enum ChannelPattern {
    Literal(String),
    Regex(Regex),
}

/// Pub-sub channels a function listens on.
#[derive(Debug, Default)]
pub struct MessagingMap {
    channels: Vec<(String, ChannelPattern)>,
}

impl MessagingMap {
    pub fn new(configs: &[MessagingConfig]) -> Result<Self> {
        let channels = configs
            .iter()
            .map(|c| {
                let pattern = if c.regex {
                    let re = Regex::new(&c.pattern).map_err(|e| {
                        Error::Config(format!("messaging `{}` has invalid regex: {e}", c.name))
                    })?;
                    ChannelPattern::Regex(re)
                } else {
                    ChannelPattern::Literal(c.pattern.clone())
                };
                Ok((c.name.clone(), pattern))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { channels })
    }

    /// Name of the first messaging entry accepting `channel`.
    pub fn find(&self, channel: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, p)| match p {
                ChannelPattern::Literal(l) => l == channel,
                ChannelPattern::Regex(re) => re.is_match(channel),
            })
            .map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
