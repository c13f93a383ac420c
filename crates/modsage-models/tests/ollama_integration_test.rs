//! Integration tests for OllamaClient against a real server.
//!
//! These tests require a running Ollama server with the llama3.2 model.
//! To run these tests:
//! 1. Install Ollama: curl https://ollama.ai/install.sh | sh
//! 2. Start Ollama: ollama serve
//! 3. Pull llama3.2: ollama pull llama3.2
//! 4. Run tests: cargo test -p modsage-models -- --ignored

use futures::StreamExt;
use modsage_abstraction::{ErrorKind, GenerateOptions, ModelClient};
use modsage_models::{DEFAULT_BASE_URL, OllamaClient};

const MODEL: &str = "llama3.2";

/// Returns `false` (and logs) when no server answers at the default URL.
async fn ollama_available() -> bool {
    let client = OllamaClient::new(MODEL.to_string());
    if client.probe().await.is_ok() {
        return true;
    }
    println!("Skipping test: Ollama server not available at {DEFAULT_BASE_URL}");
    false
}

#[tokio::test]
#[ignore = "Requires Ollama server running with llama3.2 model"]
async fn test_ollama_text_generation() {
    if !ollama_available().await {
        return;
    }

    let client = OllamaClient::new(MODEL.to_string());
    let options = GenerateOptions { temperature: Some(0.1), max_tokens: Some(16) };
    let response = client.generate_text("Say hello in one word", options).await;

    assert!(response.is_ok(), "Text generation should succeed");
    let result = response.unwrap();
    assert!(!result.content.is_empty(), "Response should not be empty");
    assert!(result.usage.is_some(), "Usage should be tracked");
}

#[tokio::test]
#[ignore = "Requires Ollama server running with llama3.2 model"]
async fn test_ollama_streaming() {
    if !ollama_available().await {
        return;
    }

    let client = OllamaClient::new(MODEL.to_string());
    let options = GenerateOptions { temperature: Some(0.1), max_tokens: Some(32) };
    let mut stream = client.generate_stream("Count to 3", options).await.unwrap();

    let mut text = String::new();
    let mut saw_done = false;
    while let Some(record) = stream.next().await {
        let record = record.expect("Stream should not error");
        text.push_str(&record.text);
        saw_done |= record.done;
    }

    assert!(!text.is_empty(), "Should receive some text");
    assert!(saw_done, "Stream should end with a terminal record");
}

#[tokio::test]
#[ignore = "Requires Ollama server running"]
async fn test_ollama_model_not_found() {
    if !ollama_available().await {
        return;
    }

    let client = OllamaClient::new("fake-model-xyz-12345".to_string());
    let err = client.generate_text("Hello", GenerateOptions::default()).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::ModelNotFound);
    assert!(err.message.contains("ollama pull"));
}

#[tokio::test]
#[ignore = "Requires Ollama server running"]
async fn test_ollama_lists_installed_models() {
    if !ollama_available().await {
        return;
    }

    let client = OllamaClient::new(MODEL.to_string());
    let models = client.list_models().await.unwrap();
    assert!(models.iter().any(|m| m.starts_with(MODEL)), "{MODEL} should be installed");
}
