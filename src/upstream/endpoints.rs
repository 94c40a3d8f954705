//! CodeWhisperer endpoint URLs per region, overridable for tests.

use url::Url;

#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    generate: Url,
    models: Url,
}

impl UpstreamEndpoints {
    pub fn for_region(region: &str) -> Self {
        let generate = Url::parse(&format!(
            "https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse"
        ))
        .expect("invalid CodeWhisperer URL for region");
        let models = Url::parse(&format!(
            "https://q.{region}.amazonaws.com/ListAvailableModels"
        ))
        .expect("invalid Q host URL for region");
        Self { generate, models }
    }

    /// Point both endpoints at a local test server.
    pub fn for_base(base: &Url) -> Self {
        let join = |path: &str| base.join(path).expect("invalid test base URL");
        Self {
            generate: join("/generateAssistantResponse"),
            models: join("/ListAvailableModels"),
        }
    }

    pub fn generate_url(&self) -> &Url {
        &self.generate
    }

    pub fn models_url(&self, profile_arn: Option<&str>) -> Url {
        let mut url = self.models.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("origin", "AI_EDITOR");
            if let Some(arn) = profile_arn {
                query.append_pair("profileArn", arn);
            }
        }
        url
    }
}
