//! Fixed-order assembly of the final LLM message list.
//!
//! The order is fixed: domain system prompt, relevant history, recent
//! history, retrieved regulations, synthesized sub-answers, then the
//! user's message. Relevant turns already present in
//! the recent block are skipped (dedup by raw query string, keeping the
//! recent occurrence).
use std::collections::HashSet;

use stamp_llm::ChatMessage;

use crate::turn::ConversationTurn;

pub struct MessageAssembly<'a> {
    pub system_prompt: &'a str,
    pub relevant: &'a [ConversationTurn],
    pub recent: &'a [ConversationTurn],
    pub relevant_header: &'a str,
    pub recent_header: &'a str,
    pub knowledge_header: &'a str,
    pub knowledge_context: Option<&'a str>,
    pub synthesized_header: &'a str,
    pub synthesized_answer: Option<&'a str>,
    pub user_message: &'a str,
}

pub fn build_messages(assembly: &MessageAssembly<'_>) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(assembly.system_prompt)];

    let recent_queries: HashSet<&str> = assembly
        .recent
        .iter()
        .map(|t| t.user_query.as_str())
        .collect();
    let relevant: Vec<&ConversationTurn> = assembly
        .relevant
        .iter()
        .filter(|t| !recent_queries.contains(t.user_query.as_str()))
        .collect();

    if !relevant.is_empty() {
        messages.push(ChatMessage::system(assembly.relevant_header));
        for turn in relevant {
            messages.push(ChatMessage::user(&turn.user_query));
            messages.push(ChatMessage::assistant(&turn.assistant_response));
        }
    }

    if !assembly.recent.is_empty() {
        messages.push(ChatMessage::system(assembly.recent_header));
        for turn in assembly.recent {
            messages.push(ChatMessage::user(&turn.user_query));
            messages.push(ChatMessage::assistant(&turn.assistant_response));
        }
    }

    if let Some(context) = assembly.knowledge_context.filter(|c| !c.is_empty()) {
        messages.push(ChatMessage::system(format!(
            "{}\n{context}",
            assembly.knowledge_header
        )));
    }

    if let Some(synthesis) = assembly.synthesized_answer.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(format!(
            "{}\n{synthesis}",
            assembly.synthesized_header
        )));
    }

    messages.push(ChatMessage::user(assembly.user_message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stamp_llm::Role;
    use uuid::Uuid;

    fn turn(q: &str, a: &str) -> ConversationTurn {
        ConversationTurn {
            turn_id: Uuid::new_v4(),
            parent_turn_id: None,
            session_id: "7_s".into(),
            user_query: q.into(),
            assistant_response: a.into(),
            timestamp: Utc::now(),
            context_docs: vec![],
            token_count: 0,
        }
    }

    fn assembly<'a>(
        relevant: &'a [ConversationTurn],
        recent: &'a [ConversationTurn],
        knowledge: Option<&'a str>,
        synthesis: Option<&'a str>,
    ) -> MessageAssembly<'a> {
        MessageAssembly {
            system_prompt: "系统提示",
            relevant,
            recent,
            relevant_header: "相关历史",
            recent_header: "最近对话",
            knowledge_header: "法规资料",
            knowledge_context: knowledge,
            synthesized_header: "综合结论",
            synthesized_answer: synthesis,
            user_message: "当前问题",
        }
    }

    #[test]
    fn full_assembly_keeps_the_fixed_order() {
        let relevant = vec![turn("早前的问题", "早前的回答")];
        let recent = vec![turn("上一个问题", "上一个回答")];
        let messages = build_messages(&assembly(
            &relevant,
            &recent,
            Some("第1条规定…"),
            Some("综合来看…"),
        ));

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System, // domain prompt
                Role::System, // relevant header
                Role::User,
                Role::Assistant,
                Role::System, // recent header
                Role::User,
                Role::Assistant,
                Role::System, // knowledge
                Role::System, // synthesis
                Role::User,   // current question
            ]
        );
        assert!(messages[7].content.contains("第1条规定"));
        assert!(messages[8].content.contains("综合来看"));
        assert_eq!(messages.last().unwrap().content, "当前问题");
    }

    #[test]
    fn relevant_turns_duplicated_in_recent_are_skipped() {
        let relevant = vec![turn("同一个问题", "旧回答"), turn("独有问题", "独有回答")];
        let recent = vec![turn("同一个问题", "新回答")];
        let messages = build_messages(&assembly(&relevant, &recent, None, None));

        let texts: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        // The duplicated query appears exactly once, from the recent block.
        assert_eq!(
            texts.iter().filter(|t| **t == "同一个问题").count(),
            1
        );
        assert!(texts.contains(&"新回答"));
        assert!(!texts.contains(&"旧回答"));
        assert!(texts.contains(&"独有问题"));
    }

    #[test]
    fn empty_sections_are_omitted_entirely() {
        let messages = build_messages(&assembly(&[], &[], None, None));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
    }

    #[test]
    fn blank_knowledge_context_is_treated_as_absent() {
        let messages = build_messages(&assembly(&[], &[], Some(""), None));
        assert_eq!(messages.len(), 2);
    }
}
