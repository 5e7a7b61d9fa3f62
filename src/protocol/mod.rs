pub mod canonical;
pub mod openai_chat;
