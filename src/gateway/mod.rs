//! Chat transport seam.
//!
//! A gateway turns user input into [`GatewayEvent`]s and executes
//! [`GatewayCommand`]s. The agent only ever sees the channel pair, so
//! replacing the console with a real chat network touches nothing else.

pub mod console;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::hitl::{ApprovalChoice, ApprovalEvent, ApprovalPresenter, MessageRef, PromptFormat};
use crate::sandbox::Upload;

/// A chat message from a user.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: i64,
    pub chat_id: i64,
    pub text: String,
    /// File sent along with the message, handed to sandboxed skills.
    pub upload: Option<Upload>,
}

/// Events emitted by the gateway.
#[derive(Debug)]
pub enum GatewayEvent {
    Connected,
    Message(IncomingMessage),
    /// A user pressed an approval button.
    ApprovalCallback(ApprovalEvent),
}

/// Commands executed by the gateway.
#[derive(Debug)]
pub enum GatewayCommand {
    SendMessage {
        chat_id: i64,
        body: String,
    },
    /// Shows an approval prompt; the gateway answers on `reply`, with an
    /// error when it cannot render `format`.
    PresentApproval {
        chat_id: i64,
        text: String,
        format: PromptFormat,
        choices: Vec<ApprovalChoice>,
        reply: oneshot::Sender<anyhow::Result<MessageRef>>,
    },
    UpdateMessage {
        chat_id: i64,
        message: MessageRef,
        body: String,
    },
}

/// Outbound delivery used by the runtime and by scheduled work.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// [`Notifier`] over the gateway command channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    cmd_tx: mpsc::Sender<GatewayCommand>,
}

impl ChannelNotifier {
    pub fn new(cmd_tx: mpsc::Sender<GatewayCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Presenter that shows approval prompts in `chat_id`.
    pub fn presenter(&self, chat_id: i64) -> ChannelPresenter {
        ChannelPresenter {
            cmd_tx: self.cmd_tx.clone(),
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.cmd_tx
            .send(GatewayCommand::SendMessage {
                chat_id,
                body: text.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("gateway is gone"))
    }
}

/// [`ApprovalPresenter`] bound to one chat.
pub struct ChannelPresenter {
    cmd_tx: mpsc::Sender<GatewayCommand>,
    chat_id: i64,
}

#[async_trait]
impl ApprovalPresenter for ChannelPresenter {
    async fn present(
        &self,
        text: &str,
        format: PromptFormat,
        choices: &[ApprovalChoice],
    ) -> anyhow::Result<MessageRef> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(GatewayCommand::PresentApproval {
                chat_id: self.chat_id,
                text: text.to_string(),
                format,
                choices: choices.to_vec(),
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("gateway is gone"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("gateway dropped the approval prompt"))?
    }

    async fn finish(&self, message: &MessageRef, text: &str) {
        let _ = self
            .cmd_tx
            .send(GatewayCommand::UpdateMessage {
                chat_id: self.chat_id,
                message: message.clone(),
                body: text.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Notifier double that records outbound messages.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }
}
