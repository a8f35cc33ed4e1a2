use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl Completion {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// One call to a generative-text model. Retries live with the caller,
/// not here.
#[async_trait::async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, instructions: &str, content: &str) -> Result<Completion>;
}

/// Picks the wire client for a job's provider. Resolved once per job run.
pub trait InvokerResolver: Send + Sync {
    fn resolve(&self, provider: &str, model: &str, api_key: String)
    -> Result<Arc<dyn ModelInvoker>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    OpenRouter,
    Anthropic,
}

impl Provider {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "openrouter" => Ok(Provider::OpenRouter),
            "anthropic" => Ok(Provider::Anthropic),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}

pub fn provider_is_known(value: &str) -> bool {
    Provider::parse(value).is_ok()
}

pub struct HttpInvokerResolver;

impl InvokerResolver for HttpInvokerResolver {
    fn resolve(
        &self,
        provider: &str,
        model: &str,
        api_key: String,
    ) -> Result<Arc<dyn ModelInvoker>> {
        match Provider::parse(provider)? {
            Provider::OpenAi => Ok(Arc::new(ChatCompletionsInvoker::new(
                OPENAI_URL, model, api_key,
            ))),
            Provider::OpenRouter => Ok(Arc::new(ChatCompletionsInvoker::new(
                OPENROUTER_URL,
                model,
                api_key,
            ))),
            Provider::Anthropic => Ok(Arc::new(AnthropicInvoker::new(model, api_key))),
        }
    }
}

/// Chat-completions wire shape, shared by OpenAI and OpenRouter.
pub struct ChatCompletionsInvoker {
    client: reqwest::Client,
    url: &'static str,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

impl ChatCompletionsInvoker {
    fn new(url: &'static str, model: &str, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            url,
            model: model.to_string(),
            api_key,
        }
    }
}

fn parse_chat_response(body: &str) -> Result<Completion> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("failed to parse completion response: {e}\nraw: {body}"))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("no content in completion response"))?;

    let usage = response.usage.unwrap_or(ChatUsage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });

    Ok(Completion {
        text,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    })
}

#[async_trait::async_trait]
impl ModelInvoker for ChatCompletionsInvoker {
    async fn invoke(&self, instructions: &str, content: &str) -> Result<Completion> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instructions,
                },
                ChatMessage {
                    role: "user",
                    content,
                },
            ],
            temperature: 0.2,
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        let response = self
            .client
            .post(self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("provider returned {status}: {body}");
        }

        parse_chat_response(&body)
    }
}

/// Anthropic messages wire shape.
pub struct AnthropicInvoker {
    client: reqwest::Client,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl AnthropicInvoker {
    fn new(model: &str, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            model: model.to_string(),
            api_key,
        }
    }
}

fn parse_messages_response(body: &str) -> Result<Completion> {
    let response: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| anyhow::anyhow!("failed to parse messages response: {e}\nraw: {body}"))?;

    let text: String = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        anyhow::bail!("no text content in messages response");
    }

    let usage = response.usage.unwrap_or(MessagesUsage {
        input_tokens: 0,
        output_tokens: 0,
    });

    Ok(Completion {
        text,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    })
}

#[async_trait::async_trait]
impl ModelInvoker for AnthropicInvoker {
    async fn invoke(&self, instructions: &str, content: &str) -> Result<Completion> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            system: instructions,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("provider returned {status}: {body}");
        }

        parse_messages_response(&body)
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::sync::Mutex;

    type InvokeFn = dyn Fn(&str, &str, usize) -> Result<Completion> + Send + Sync;

    /// Scriptable invoker: the closure receives (instructions, content,
    /// zero-based call number) and every call is recorded.
    pub struct StubInvoker {
        behavior: Box<InvokeFn>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StubInvoker {
        pub fn new<F>(behavior: F) -> Arc<Self>
        where
            F: Fn(&str, &str, usize) -> Result<Completion> + Send + Sync + 'static,
        {
            Arc::new(Self {
                behavior: Box::new(behavior),
                calls: Mutex::new(Vec::new()),
            })
        }

        /// Answers every numbered input line with `ok:<input>` under the
        /// same number; a bare input gets a single `ok:<input>` line.
        pub fn echoing() -> Arc<Self> {
            Self::new(|_, content, _| Ok(echo_completion(content)))
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    pub fn echo_completion(content: &str) -> Completion {
        let mut lines = Vec::new();
        for line in content.lines() {
            match line.split_once(". ") {
                Some((n, rest)) if n.chars().all(|c| c.is_ascii_digit()) => {
                    lines.push(format!("{n}. ok:{rest}"));
                }
                _ => {}
            }
        }
        let text = if lines.is_empty() {
            format!("ok:{content}")
        } else {
            lines.join("\n")
        };
        Completion {
            text,
            input_tokens: 10,
            output_tokens: 14,
        }
    }

    #[async_trait::async_trait]
    impl ModelInvoker for StubInvoker {
        async fn invoke(&self, instructions: &str, content: &str) -> Result<Completion> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(content.to_string());
                calls.len() - 1
            };
            (self.behavior)(instructions, content, call)
        }
    }

    pub struct StubResolver {
        pub invoker: Arc<StubInvoker>,
    }

    impl InvokerResolver for StubResolver {
        fn resolve(&self, _: &str, _: &str, _: String) -> Result<Arc<dyn ModelInvoker>> {
            Ok(self.invoker.clone())
        }
    }
}
