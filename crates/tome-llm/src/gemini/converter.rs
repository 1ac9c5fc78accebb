use tracing::warn;

use tome_core::context::GenerationContext;
use tome_core::messages::{Part, Role, Turn};

use super::types::{ApiPart, Content, GenerateContentRequest, GenerationConfig};

/// Build the request body for `generateContent` / `streamGenerateContent`.
///
/// System-role turns are folded into the system instruction, since Gemini
/// only accepts `user` and `model` roles inside `contents`.
pub fn build_request(context: &GenerationContext) -> GenerateContentRequest {
    let mut system_text = context.system_instruction.clone();
    let mut contents = Vec::with_capacity(context.turns.len());

    for turn in &context.turns {
        match turn.role {
            Role::System => {
                let text = turn.text();
                if !text.is_empty() {
                    if !system_text.is_empty() {
                        system_text.push_str("\n\n");
                    }
                    system_text.push_str(&text);
                }
            }
            Role::User | Role::Assistant => {
                if let Some(content) = convert_turn(turn) {
                    contents.push(content);
                }
            }
        }
    }

    let system_instruction = (!system_text.is_empty()).then(|| Content {
        role: None,
        parts: vec![ApiPart::text(system_text)],
    });

    let options = &context.options;
    let generation_config = (options.temperature.is_some() || options.max_output_tokens.is_some())
        .then(|| GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_output_tokens,
        });

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config,
    }
}

fn convert_turn(turn: &Turn) -> Option<Content> {
    let role = match turn.role {
        Role::Assistant => "model",
        _ => "user",
    };

    let parts: Vec<ApiPart> = turn
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(ApiPart::text(text.clone())),
            Part::FileRef { mime_type, uri } => Some(ApiPart::file(mime_type.clone(), uri.clone())),
            Part::Unknown { kind, .. } => {
                warn!(kind = %kind, "dropping unsupported part from request");
                None
            }
        })
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(Content {
        role: Some(role.to_string()),
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tome_core::asset::{AssetRef, AssetState};
    use tome_core::context::GenerationOptions;

    fn context(turns: Vec<Turn>) -> GenerationContext {
        GenerationContext {
            system_instruction: "You are a novelist.".into(),
            turns,
            options: GenerationOptions {
                temperature: Some(2.0),
                max_output_tokens: None,
            },
        }
    }

    #[test]
    fn roles_map_to_user_and_model() {
        let req = build_request(&context(vec![
            Turn::user("first", &[]),
            Turn::assistant("reply"),
            Turn::user("second", &[]),
        ]));
        let roles: Vec<_> = req.contents.iter().map(|c| c.role.clone().unwrap()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(req.generation_config.unwrap().temperature, Some(2.0));
    }

    #[test]
    fn file_refs_become_file_data() {
        let asset = AssetRef {
            logical_name: "outline.txt".into(),
            remote_id: "files/1".into(),
            mime_type: "text/plain".into(),
            uri: "https://g/files/1".into(),
            state: AssetState::Active,
        };
        let req = build_request(&context(vec![Turn::user("read this", &[asset])]));
        let parts = &req.contents[0].parts;
        assert_eq!(parts.len(), 2);
        let file = parts[1].file_data.as_ref().unwrap();
        assert_eq!(file.file_uri, "https://g/files/1");
        assert_eq!(file.mime_type, "text/plain");
    }

    #[test]
    fn system_turns_fold_into_instruction() {
        let system = Turn {
            role: Role::System,
            parts: vec![Part::text("Write in Traditional Chinese.")],
        };
        let req = build_request(&context(vec![system, Turn::user("go", &[])]));
        assert_eq!(req.contents.len(), 1);
        let instruction = req.system_instruction.unwrap();
        let text = instruction.parts[0].text.clone().unwrap();
        assert!(text.starts_with("You are a novelist."));
        assert!(text.ends_with("Write in Traditional Chinese."));
    }

    #[test]
    fn unknown_parts_dropped_and_empty_turns_skipped() {
        let odd = Turn {
            role: Role::Assistant,
            parts: vec![Part::Unknown {
                kind: "executableCode".into(),
                raw: serde_json::Value::Null,
            }],
        };
        let req = build_request(&context(vec![Turn::user("a", &[]), odd]));
        assert_eq!(req.contents.len(), 1);
    }

    #[test]
    fn no_generation_config_without_options() {
        let mut ctx = context(vec![Turn::user("a", &[])]);
        ctx.options = GenerationOptions::default();
        assert!(build_request(&ctx).generation_config.is_none());
    }
}
