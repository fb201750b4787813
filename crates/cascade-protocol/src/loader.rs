use crate::message::Message;
use crate::{ProtoError, wire_tags};

wire_tags! {
    pub enum LoaderRequestTag ("loader request") {
        CompositionReplace = 0,
    }
}

wire_tags! {
    pub enum LoaderReplyTag ("loader reply") {
        CompositionReplaced = 0,
    }
}

/// Asks the loader to swap the composition module.
///
/// `unload` is applied first (dependents before dependencies), then `load`
/// (dependencies before dependents), then the new module is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderRequest {
    pub module_path: String,
    pub load: Vec<String>,
    pub unload: Vec<String>,
    pub change_description: Option<String>,
}

impl LoaderRequest {
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(LoaderRequestTag::CompositionReplace);
        message.push(self.module_path.as_str());
        message.push_list(self.load.iter().cloned());
        message.push_list(self.unload.iter().cloned());
        message.push(self.change_description.clone());
        message
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtoError> {
        LoaderRequestTag::try_from(message.tag)?;
        let mut r = message.reader();
        let request = Self {
            module_path: r.string()?.to_string(),
            load: r.string_list()?,
            unload: r.string_list()?,
            change_description: r.optional_string()?.map(str::to_string),
        };
        r.finish()?;
        Ok(request)
    }
}

pub fn replaced_reply(success: bool) -> Message {
    Message::new(LoaderReplyTag::CompositionReplaced).with(success)
}

#[cfg(test)]
mod tests {
    use super::{LoaderRequest, replaced_reply};

    #[test]
    fn replace_request_keeps_plan_order_and_absent_description() {
        let request = LoaderRequest {
            module_path: "/tmp/comp.so".to_string(),
            load: vec!["libb.so".to_string(), "liba.so".to_string()],
            unload: vec!["liba.so".to_string(), "libb.so".to_string()],
            change_description: None,
        };
        let decoded = LoaderRequest::from_message(&request.to_message()).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn replaced_reply_carries_success_flag() {
        let reply = replaced_reply(false);
        assert!(!reply.reader().boolean().expect("flag"));
    }
}
