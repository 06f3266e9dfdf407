use crate::config::{AssistantConfig, AssistantKind};
use crate::models::{Scenario, TestPrompt};
use crate::rate_limit::RateLimiter;
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use std::sync::Arc;

/// The assistant under test: answers one scenario prompt
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn respond(&self, scenario: &Scenario, prompt: &TestPrompt) -> Result<String>;
}

/// Create an OpenAI-compatible client whose key is read from `env_var_api_key`
pub(crate) fn openai_client(api_endpoint: &str, env_var_api_key: &str) -> Result<Client<OpenAIConfig>> {
    let api_key = std::env::var(env_var_api_key)
        .with_context(|| format!("Environment variable {} not found", env_var_api_key))?;

    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_endpoint);

    Ok(Client::with_config(openai_config))
}

/// Text of the first choice, empty when the model returned nothing
pub(crate) fn first_choice_content(response: CreateChatCompletionResponse) -> String {
    match response.choices.into_iter().next() {
        Some(choice) => choice.message.content.unwrap_or_default(),
        None => String::new(),
    }
}

/// Assistant backed by a chat completion model
pub struct OpenAiAssistant {
    config: AssistantConfig,
    limiter: RateLimiter,
}

impl OpenAiAssistant {
    pub fn new(config: AssistantConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_rps);
        Self { config, limiter }
    }

    /// System prompt with the persona folded in
    fn system_prompt_for(&self, scenario: &Scenario) -> String {
        let persona = &scenario.persona;
        let mut prompt = format!("{}\n\nYou are talking to {}.", self.config.system_prompt, persona.name);
        if !persona.traits.is_empty() {
            prompt.push_str(&format!(" They are: {}.", persona.traits.join(", ")));
        }
        if !persona.accessibility_needs.is_empty() {
            prompt.push_str(&format!(
                " Accommodate these accessibility needs: {}.",
                persona.accessibility_needs.join(", ")
            ));
        }
        prompt
    }

    fn build_request(&self, scenario: &Scenario, prompt: &TestPrompt) -> Result<CreateChatCompletionRequest> {
        let system_message = ChatCompletionRequestSystemMessageArgs::default()
            .content(self.system_prompt_for(scenario))
            .build()
            .context("Failed to build system message")?
            .into();

        let user_message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.prompt.clone())
            .build()
            .context("Failed to build user message")?
            .into();

        CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .messages([system_message, user_message])
            .temperature(self.config.temperature as f32)
            .max_tokens(self.config.max_tokens)
            .build()
            .context("Failed to build chat completion request")
    }
}

#[async_trait]
impl Assistant for OpenAiAssistant {
    async fn respond(&self, scenario: &Scenario, prompt: &TestPrompt) -> Result<String> {
        self.limiter.acquire().await;

        let client = openai_client(&self.config.api_endpoint, &self.config.env_var_api_key)?;
        let request = self.build_request(scenario, prompt)?;
        let response = client
            .chat()
            .create(request)
            .await
            .context("Failed to generate assistant response")?;

        Ok(first_choice_content(response))
    }
}

/// Assistant that always gives the same answer, for offline runs
pub struct CannedAssistant {
    response: String,
}

impl CannedAssistant {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

#[async_trait]
impl Assistant for CannedAssistant {
    async fn respond(&self, _scenario: &Scenario, _prompt: &TestPrompt) -> Result<String> {
        Ok(self.response.clone())
    }
}

pub fn build_assistant(config: &AssistantConfig) -> Arc<dyn Assistant> {
    match config.kind {
        AssistantKind::OpenAi => Arc::new(OpenAiAssistant::new(config.clone())),
        AssistantKind::Canned => Arc::new(CannedAssistant::new(config.canned_response.clone())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Difficulty, Persona};

    pub(crate) fn chat_completion_body(content: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "created": 1_700_000_000u32,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
        })
        .to_string()
    }

    pub(crate) fn test_scenario() -> Scenario {
        Scenario {
            name: "Family Coordination".to_string(),
            persona: Persona {
                name: "Morgan".to_string(),
                traits: vec!["methodical".to_string()],
                accessibility_needs: vec!["screen reader".to_string()],
            },
            category: "shared_calendars".to_string(),
            difficulty: Difficulty::Medium,
            test_prompts: vec![TestPrompt { prompt: "Find a free evening".to_string(), intent: None }],
            expected_behaviors: vec![],
        }
    }

    fn test_config(api_endpoint: &str, env_var: &str) -> AssistantConfig {
        AssistantConfig {
            api_endpoint: api_endpoint.to_string(),
            env_var_api_key: env_var.to_string(),
            rate_limit_rps: 0.0,
            ..AssistantConfig::default()
        }
    }

    #[test]
    fn test_system_prompt_includes_persona() {
        let assistant = OpenAiAssistant::new(AssistantConfig::default());
        let prompt = assistant.system_prompt_for(&test_scenario());
        assert!(prompt.contains("Morgan"));
        assert!(prompt.contains("methodical"));
        assert!(prompt.contains("screen reader"));
    }

    #[tokio::test]
    async fn test_respond_missing_env_var() {
        let env_var = "CALENDAR_EVAL_TEST_MISSING_ASSISTANT_KEY";
        unsafe {
            std::env::remove_var(env_var);
        }
        let assistant = OpenAiAssistant::new(test_config("http://127.0.0.1:9", env_var));
        let scenario = test_scenario();

        let result = assistant.respond(&scenario, &scenario.test_prompts[0]).await;
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_respond_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(chat_completion_body("Dinner is on Thursday at 7pm."))
            .create_async()
            .await;

        let env_var = "CALENDAR_EVAL_TEST_ASSISTANT_KEY";
        unsafe {
            std::env::set_var(env_var, "test-key");
        }
        let assistant = OpenAiAssistant::new(test_config(&server.url(), env_var));
        let scenario = test_scenario();

        let response = assistant.respond(&scenario, &scenario.test_prompts[0]).await.unwrap();
        assert_eq!(response, "Dinner is on Thursday at 7pm.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_canned_assistant() {
        let assistant = build_assistant(&AssistantConfig {
            kind: AssistantKind::Canned,
            canned_response: "Booked.".to_string(),
            ..AssistantConfig::default()
        });
        let scenario = test_scenario();
        let response = assistant.respond(&scenario, &scenario.test_prompts[0]).await.unwrap();
        assert_eq!(response, "Booked.");
    }
}
