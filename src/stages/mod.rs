//! Concrete per-item transforms and the collaborators they call out to.

pub mod fetch;
pub mod llm;
pub mod markdown;
pub mod product;

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::error::TransformError;
    use crate::stages::fetch::Fetcher;
    use crate::stages::llm::{ChatClient, ChatRequest};

    /// Serves `<html><body>{address}</body></html>` and records every call.
    /// Clones share the call log, so a test can keep a handle after moving
    /// the fetcher into a pipeline.
    #[derive(Debug, Clone, Default)]
    pub struct FakeFetcher {
        calls: Rc<RefCell<Vec<(String, bool)>>>,
    }

    impl FakeFetcher {
        pub fn calls(&self) -> Vec<(String, bool)> {
            self.calls.borrow().clone()
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch(&mut self, address: &str, execute_js: bool) -> Result<String, TransformError> {
            self.calls
                .borrow_mut()
                .push((address.to_string(), execute_js));
            Ok(format!("<html><body>{}</body></html>", address))
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeChat {
        reply: String,
        requests: Rc<RefCell<Vec<ChatRequest>>>,
    }

    impl FakeChat {
        pub fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                ..Default::default()
            }
        }

        pub fn requests(&self) -> Vec<ChatRequest> {
            self.requests.borrow().clone()
        }
    }

    impl ChatClient for FakeChat {
        fn complete(&mut self, request: &ChatRequest) -> Result<String, TransformError> {
            self.requests.borrow_mut().push(request.clone());
            Ok(self.reply.clone())
        }
    }
}
