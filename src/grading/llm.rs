//! Vision-model grader: every page as an image, one rubric request, then an
//! optional text-only feedback request built from the finished report.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 from LLM APIs are transient. Exponential backoff
//! (`retry_backoff_ms * 2^attempt`) with 500 ms base and 3 retries waits
//! 500 ms → 1 s → 2 s before giving up with [`PipelineError::LlmApiError`].

use super::{GradeReport, Grader, Student};
use crate::error::PipelineError;
use crate::pipeline::decode::DocumentDecoder;
use crate::prompts::{feedback_prompt, rubric_prompt, GRADE_REQUEST};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Request knobs for [`LlmGrader`].
#[derive(Debug, Clone)]
pub struct GraderConfig {
    /// Rasterisation DPI of the page images. Default: 150.
    pub dpi: u32,
    /// Default: 0.1.
    pub temperature: f32,
    /// Default: 8192; ten justified criteria are long.
    pub max_tokens: usize,
    /// Default: 3.
    pub max_retries: u32,
    /// Default: 500.
    pub retry_backoff_ms: u64,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// [`Grader`] backed by an `edgequake-llm` vision provider.
pub struct LlmGrader {
    provider: Arc<dyn LLMProvider>,
    decoder: Arc<dyn DocumentDecoder>,
    config: GraderConfig,
}

impl LlmGrader {
    pub fn new(provider: Arc<dyn LLMProvider>, decoder: Arc<dyn DocumentDecoder>) -> Self {
        Self {
            provider,
            decoder,
            config: GraderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GraderConfig) -> Self {
        self.config = config;
        self
    }

    /// Grader with the provider resolved from arguments or environment.
    ///
    /// Resolution order:
    /// 1. `provider_name` (+ `model`, default `gpt-4.1-nano`)
    /// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set
    /// 3. `OPENAI_API_KEY`
    /// 4. whatever `ProviderFactory::from_env` detects
    pub fn from_env(
        decoder: Arc<dyn DocumentDecoder>,
        provider_name: Option<&str>,
        model: Option<&str>,
    ) -> Result<Self, PipelineError> {
        let provider = resolve_provider(provider_name, model)?;
        Ok(Self::new(provider, decoder))
    }

    async fn render_pages(&self, pdf: &Path) -> Result<Vec<ImageData>, PipelineError> {
        let decoder = Arc::clone(&self.decoder);
        let path = pdf.to_path_buf();
        let dpi = self.config.dpi;

        tokio::task::spawn_blocking(move || {
            let pages = decoder
                .with_document(&path, |doc| {
                    (0..doc.page_count())
                        .map(|i| doc.rasterize(i, dpi))
                        .collect::<Result<Vec<_>, _>>()
                })
                .and_then(|pages| pages)
                .map_err(|e| PipelineError::CorruptPdf {
                    path: path.clone(),
                    detail: e.to_string(),
                })?;
            pages
                .iter()
                .map(encode_page)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PipelineError::Internal(format!("PNG encoding failed: {}", e)))
        })
        .await
        .map_err(|e| PipelineError::TaskPanicked {
            stage: "Grading render",
            detail: e.to_string(),
        })?
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        }
    }

    /// Send `messages`, retrying with exponential backoff; the reply text.
    async fn chat_with_retry(
        &self,
        what: &str,
        messages: &[ChatMessage],
    ) -> Result<String, PipelineError> {
        let options = self.build_options();
        let start = Instant::now();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    what, attempt, self.config.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        what,
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    let err_msg = format!("{}", e);
                    warn!("{}: attempt {} failed: {}", what, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(PipelineError::LlmApiError {
            message: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn grade(&self, pdf: &Path, architect: &str) -> Result<GradeReport, PipelineError> {
        let images = self.render_pages(pdf).await?;
        if images.is_empty() {
            return Err(PipelineError::CorruptPdf {
                path: pdf.to_path_buf(),
                detail: "document has no pages".to_string(),
            });
        }
        info!("Grading {} ({} pages) for {}", pdf.display(), images.len(), architect);

        let messages = vec![
            ChatMessage::system(&rubric_prompt(architect)),
            ChatMessage::user_with_images(GRADE_REQUEST, images),
        ];
        let reply = self.chat_with_retry("Grading", &messages).await?;
        let report = GradeReport::from_evaluation(architect, reply);
        if report.scorecard.scores.is_empty() {
            warn!("Grading: no scores found in the reply");
        }
        Ok(report)
    }

    async fn feedback(
        &self,
        student: &Student,
        report: &GradeReport,
    ) -> Result<String, PipelineError> {
        info!(
            "Feedback for {} ({}%, {})",
            student.pid, report.scorecard.final_percent, report.scorecard.grade
        );
        let messages = vec![ChatMessage::user(feedback_prompt(student, report))];
        self.chat_with_retry("Feedback", &messages).await
    }
}

/// PNG, base64, `detail: "high"` so fine print in captions stays legible.
fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn resolve_provider(
    provider_name: Option<&str>,
    model: Option<&str>,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    let model_or_default = model.unwrap_or("gpt-4.1-nano");
    if let Some(name) = provider_name {
        return create_vision_provider(name, model_or_default);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_vision_provider("openai", model_or_default);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or GEMINI_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::grading::{Criterion, LetterGrade};
    use crate::pipeline::decode::{DecodedDocument, PageSize, RawImage};
    use edgequake_llm::MockProvider;
    use image::{Rgba, RgbaImage};

    /// Every path opens as a two-page blank document.
    struct BlankPages;

    impl DecodedDocument for BlankPages {
        fn page_count(&self) -> usize {
            2
        }
        fn page_size(&self, _index: usize) -> Result<PageSize, DecodeError> {
            Ok(PageSize {
                width: 612.0,
                height: 792.0,
            })
        }
        fn embedded_images(&self, _index: usize) -> Result<Vec<RawImage>, DecodeError> {
            Ok(Vec::new())
        }
        fn rasterize(&self, _index: usize, _dpi: u32) -> Result<DynamicImage, DecodeError> {
            Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                4,
                4,
                Rgba([255, 255, 255, 255]),
            )))
        }
    }

    impl DocumentDecoder for BlankPages {
        fn open_document(
            &self,
            _path: &Path,
            visit: &mut dyn FnMut(&dyn DecodedDocument),
        ) -> Result<(), DecodeError> {
            visit(self);
            Ok(())
        }
    }

    #[tokio::test]
    async fn grade_then_feedback_through_provider() {
        let provider = MockProvider::new();
        provider
            .add_response(
                "**Final Summary:**\n1. Architect Selection & Scope: 5/5\n\
                 7. Coverage of 10 Famous Buildings: 4/5\n",
            )
            .await;
        provider
            .add_response("Strong architect choice; cite your images.")
            .await;
        let grader = LlmGrader::new(Arc::new(provider), Arc::new(BlankPages));

        let report = grader
            .grade(Path::new("student.pdf"), "Bjarke Ingels")
            .await
            .unwrap();
        assert_eq!(report.architect, "Bjarke Ingels");
        assert_eq!(report.scorecard.scores[&Criterion::TenBuildings], 4);
        assert_eq!(report.scorecard.final_percent, 18.0);
        assert_eq!(report.scorecard.grade, LetterGrade::F);

        let feedback = grader
            .feedback(&Student::new("Ada", "A1"), &report)
            .await
            .unwrap();
        assert_eq!(feedback, "Strong architect choice; cite your images.");
    }

    #[test]
    fn encode_small_page() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 255, 255])));
        let data = encode_page(&img).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert!(image::load_from_memory(&decoded).is_ok());
    }

    #[test]
    fn default_config() {
        let c = GraderConfig::default();
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.retry_backoff_ms, 500);
        assert_eq!(c.dpi, 150);
    }
}
