//! LLM integration for the evaluation harness.
//!
//! Provides an OpenAI-compatible chat client behind the `LlmProvider` trait,
//! so the evaluator can be driven by a live endpoint or a test double.
//!
//! ```ignore
//! use refine_harness::llm::{ChatClient, GenerationRequest, LlmProvider, Message};
//!
//! let client = ChatClient::from_env()?;
//! let request = GenerationRequest::new("gpt-4.1", vec![Message::user("Score this model")])
//!     .with_temperature(0.2);
//! let response = client.generate(request).await?;
//! println!("{}", response.first_content().unwrap_or_default());
//! ```

pub mod client;

pub use client::{
    ChatClient, Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage,
    DEFAULT_API_BASE,
};
