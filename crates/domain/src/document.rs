use serde_json::{Map, Value};
use tablefix_core::{TableFixError, TableFixResult};

/// 包装对象中题目数组的字段名
pub const QUESTIONS_KEY: &str = "questoes";

/// 上传文档的外层结构，输出必须保持一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    /// 题目数组
    Array,
    /// 带 `questoes` 数组的对象
    Wrapped,
}

/// 解析后的试题文档
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    shape: DocumentShape,
    /// 包装对象中除题目数组以外的字段
    envelope: Map<String, Value>,
    questions: Vec<Value>,
}

impl Document {
    pub fn parse(text: &str) -> TableFixResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> TableFixResult<Self> {
        match value {
            Value::Array(questions) => Ok(Self {
                shape: DocumentShape::Array,
                envelope: Map::new(),
                questions,
            }),
            Value::Object(mut envelope) => match envelope.remove(QUESTIONS_KEY) {
                Some(Value::Array(questions)) => Ok(Self {
                    shape: DocumentShape::Wrapped,
                    envelope,
                    questions,
                }),
                Some(_) => Err(TableFixError::InvalidDocument(format!(
                    "`{QUESTIONS_KEY}` 必须是数组"
                ))),
                None => Err(TableFixError::InvalidDocument(format!(
                    "对象中缺少 `{QUESTIONS_KEY}` 数组"
                ))),
            },
            _ => Err(TableFixError::InvalidDocument(
                "文档必须是题目数组或包含题目数组的对象".to_string(),
            )),
        }
    }

    pub fn shape(&self) -> DocumentShape {
        self.shape
    }

    pub fn questions(&self) -> &[Value] {
        &self.questions
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// 题目中某个字段的文本，字段不存在或不是字符串时返回None
    pub fn field_text(&self, question_index: usize, field: &str) -> Option<&str> {
        self.questions
            .get(question_index)
            .and_then(|q| q.get(field))
            .and_then(Value::as_str)
    }

    /// 替换题目中某个字符串字段，返回是否写入
    pub fn set_field_text(&mut self, question_index: usize, field: &str, text: String) -> bool {
        match self
            .questions
            .get_mut(question_index)
            .and_then(Value::as_object_mut)
        {
            Some(question) if question.get(field).is_some_and(Value::is_string) => {
                question.insert(field.to_string(), Value::String(text));
                true
            }
            _ => false,
        }
    }

    /// 题目自带的标识（`id` 字段），数字或字符串
    pub fn question_id(&self, question_index: usize) -> Option<String> {
        match self.questions.get(question_index)?.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn question_str(&self, question_index: usize, keys: &[&str]) -> Option<String> {
        let question = self.questions.get(question_index)?;
        keys.iter()
            .find_map(|key| question.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }

    pub fn into_value(self) -> Value {
        match self.shape {
            DocumentShape::Array => Value::Array(self.questions),
            DocumentShape::Wrapped => {
                let mut envelope = self.envelope;
                envelope.insert(QUESTIONS_KEY.to_string(), Value::Array(self.questions));
                Value::Object(envelope)
            }
        }
    }

    pub fn to_json_pretty(&self) -> TableFixResult<String> {
        Ok(serde_json::to_string_pretty(&self.clone().into_value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_array_shape_is_preserved() {
        let doc = Document::parse(r#"[{"enunciado":"a"},{"enunciado":"b"}]"#).unwrap();
        assert_eq!(doc.shape(), DocumentShape::Array);
        assert_eq!(doc.len(), 2);
        assert!(doc.into_value().is_array());
    }

    #[test]
    fn test_wrapped_shape_keeps_envelope() {
        let doc = Document::parse(r#"{"prova":"ENEM","questoes":[{"id":7,"enunciado":"x"}]}"#)
            .unwrap();
        assert_eq!(doc.shape(), DocumentShape::Wrapped);
        assert_eq!(doc.question_id(0).as_deref(), Some("7"));

        let value = doc.into_value();
        assert_eq!(value["prova"], json!("ENEM"));
        assert_eq!(value["questoes"][0]["enunciado"], json!("x"));
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        assert!(Document::parse(r#"{"questions":[]}"#).is_err());
        assert!(Document::parse(r#"{"questoes":"nope"}"#).is_err());
        assert!(Document::parse("42").is_err());
        assert!(Document::parse("not json").is_err());
    }

    #[test]
    fn test_set_field_text_only_touches_existing_strings() {
        let mut doc = Document::parse(r#"[{"enunciado":"a","nota":3}]"#).unwrap();
        assert!(doc.set_field_text(0, "enunciado", "b".to_string()));
        assert_eq!(doc.field_text(0, "enunciado"), Some("b"));
        assert!(!doc.set_field_text(0, "nota", "x".to_string()));
        assert!(!doc.set_field_text(0, "resolucao", "x".to_string()));
        assert!(!doc.set_field_text(5, "enunciado", "x".to_string()));
    }
}
