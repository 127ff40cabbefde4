//! Slack Socket Mode client and Web API wrapper.

use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiChatUpdateRequest,
    SlackApiConversationsHistoryRequest, SlackApiConversationsRepliesRequest, SlackApiFilesComplete,
    SlackApiFilesCompleteUploadExternalRequest, SlackApiFilesGetUploadUrlExternalRequest,
    SlackApiToken, SlackApiTokenType, SlackApiTokenValue, SlackBlock, SlackChannelId, SlackClient,
    SlackClientEventsListenerEnvironment, SlackClientHyperHttpsConnector, SlackClientSession,
    SlackClientSocketModeConfig, SlackClientSocketModeListener, SlackHistoryMessage,
    SlackMessageContent, SlackSocketModeListenerCallbacks, SlackTs,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::slack::{events, BotState};
use crate::{AppError, Result};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Slack Socket Mode wrapper around the Web API client.
pub struct SlackService {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
    bot_token_value: String,
    http_client: reqwest::Client,
}

impl SlackService {
    /// Create the Slack client from the bot and app tokens.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the HTTPS connector cannot be created.
    pub fn new(bot_token: &str, app_token: &str) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Slack(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));

        Ok(Self {
            client,
            bot_token: api_token(bot_token, SlackApiTokenType::Bot),
            app_token: api_token(app_token, SlackApiTokenType::App),
            bot_token_value: bot_token.to_owned(),
            http_client: reqwest::Client::new(),
        })
    }

    /// Start the Socket Mode listener with the shared bot state.
    ///
    /// The returned handle runs until the listener exits; abort it on
    /// shutdown.
    #[must_use]
    pub fn start_socket_mode(&self, state: Arc<BotState>) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(&self.client))
                .with_user_state(state)
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "socket hello");
            })
            .with_push_events(events::handle_push)
            .with_interaction_events(events::handle_interaction);
        let config = SlackClientSocketModeConfig::new();

        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);
        let app_token = self.app_token.clone();
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "socket mode listen failed");
                return;
            }

            listener.serve().await;
            info!("socket mode listener exited");
        })
    }

    /// Create an HTTP session for direct API calls using the bot token.
    #[must_use]
    pub fn http_session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.bot_token)
    }

    /// Post a plain-text message, optionally threaded.
    ///
    /// Rate-limited sends are retried with backoff before giving up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the send still fails after retries.
    pub async fn post_message(
        &self,
        channel: SlackChannelId,
        text: impl Into<String>,
        thread_ts: Option<SlackTs>,
    ) -> Result<SlackTs> {
        let content = SlackMessageContent::new().with_text(text.into());
        self.post_content(channel, content, thread_ts).await
    }

    /// Post a block-kit message, optionally threaded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the send still fails after retries.
    pub async fn post_blocks(
        &self,
        channel: SlackChannelId,
        blocks: Vec<SlackBlock>,
        thread_ts: Option<SlackTs>,
    ) -> Result<SlackTs> {
        let content = SlackMessageContent::new().with_blocks(blocks);
        self.post_content(channel, content, thread_ts).await
    }

    async fn post_content(
        &self,
        channel: SlackChannelId,
        content: SlackMessageContent,
        thread_ts: Option<SlackTs>,
    ) -> Result<SlackTs> {
        let mut request = SlackApiChatPostMessageRequest::new(channel, content);
        request.thread_ts = thread_ts;

        let session = self.http_session();
        let mut backoff = INITIAL_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match session.chat_post_message(&request).await {
                Ok(response) => return Ok(response.ts),
                Err(error) => {
                    if attempt >= MAX_SEND_ATTEMPTS {
                        return Err(AppError::Slack(format!("failed to post message: {error}")));
                    }
                    let delay = match &error {
                        slack_morphism::errors::SlackClientError::RateLimitError(rate) => {
                            rate.retry_after.unwrap_or(backoff)
                        }
                        _ => backoff,
                    };
                    warn!(?error, ?delay, attempt, "slack post failed; retrying");
                    sleep(delay).await;
                    backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    /// Replace an existing message with plain text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the Slack API call fails.
    pub async fn update_message(
        &self,
        channel: SlackChannelId,
        ts: SlackTs,
        text: impl Into<String>,
    ) -> Result<()> {
        let content = SlackMessageContent::new().with_text(text.into());
        let request = SlackApiChatUpdateRequest::new(channel, content, ts);
        self.http_session()
            .chat_update(&request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to update message: {err}")))?;
        Ok(())
    }

    /// Replace an existing message with blocks (e.g. swap buttons for the
    /// decision).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the Slack API call fails.
    pub async fn update_blocks(
        &self,
        channel: SlackChannelId,
        ts: SlackTs,
        blocks: Vec<SlackBlock>,
    ) -> Result<()> {
        let content = SlackMessageContent::new().with_blocks(blocks);
        let request = SlackApiChatUpdateRequest::new(channel, content, ts);
        self.http_session()
            .chat_update(&request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to update message: {err}")))?;
        Ok(())
    }

    /// Fetch exactly the message at `ts` from a channel.
    ///
    /// Mention events do not carry the files array, so attachment discovery
    /// re-reads the message through the history API.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the Slack API call fails.
    pub async fn fetch_message(
        &self,
        channel: SlackChannelId,
        ts: &SlackTs,
    ) -> Result<Option<SlackHistoryMessage>> {
        let mut request = SlackApiConversationsHistoryRequest::new().with_channel(channel);
        request.latest = Some(ts.clone());
        request.oldest = Some(ts.clone());
        request.inclusive = Some(true);
        request.limit = Some(1);

        let response = self
            .http_session()
            .conversations_history(&request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to read history: {err}")))?;
        Ok(response.messages.into_iter().next())
    }

    /// Fetch exactly the reply at `ts` inside a thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the Slack API call fails.
    pub async fn fetch_thread_reply(
        &self,
        channel: SlackChannelId,
        thread_ts: &SlackTs,
        ts: &SlackTs,
    ) -> Result<Option<SlackHistoryMessage>> {
        let mut request = SlackApiConversationsRepliesRequest::new(channel, thread_ts.clone());
        request.latest = Some(ts.clone());
        request.oldest = Some(ts.clone());
        request.inclusive = Some(true);
        request.limit = Some(1);

        let response = self
            .http_session()
            .conversations_replies(&request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to read replies: {err}")))?;
        Ok(response
            .messages
            .into_iter()
            .find(|message| &message.origin.ts == ts))
    }

    /// Upload content to a channel using the external upload flow.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if any upload step fails.
    pub async fn upload_file(
        &self,
        channel: SlackChannelId,
        thread_ts: Option<SlackTs>,
        filename: &str,
        title: &str,
        comment: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let session = self.http_session();

        // Step 1: get the upload URL.
        let url_request =
            SlackApiFilesGetUploadUrlExternalRequest::new(filename.into(), content.len());
        let url_response = session
            .get_upload_url_external(&url_request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to get upload url: {err}")))?;

        // Step 2: upload the content to the URL.
        self.http_client
            .post(url_response.upload_url.0.to_string())
            .body(content)
            .send()
            .await
            .map_err(|err| AppError::Slack(format!("failed to upload file: {err}")))?;

        // Step 3: complete the upload into the channel.
        let file_ref = SlackApiFilesComplete {
            id: url_response.file_id,
            title: Some(title.into()),
        };
        let mut complete_request = SlackApiFilesCompleteUploadExternalRequest::new(vec![file_ref]);
        complete_request.channel_id = Some(channel);
        complete_request.thread_ts = thread_ts;
        complete_request.initial_comment = Some(comment.to_owned());
        session
            .files_complete_upload_external(&complete_request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to complete upload: {err}")))?;

        Ok(())
    }

    /// Download a Slack-hosted file using the bot token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` on a failed request or error status.
    pub async fn download_url(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.bot_token_value)
            .send()
            .await
            .map_err(|err| AppError::Slack(format!("failed to download file: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Slack(format!(
                "file download returned {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| AppError::Slack(format!("failed to read file body: {err}")))
    }
}

fn api_token(value: &str, token_type: SlackApiTokenType) -> SlackApiToken {
    SlackApiToken {
        token_value: SlackApiTokenValue(value.to_owned()),
        cookie: None,
        team_id: None,
        scope: None,
        token_type: Some(token_type),
    }
}
