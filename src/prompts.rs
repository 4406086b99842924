//! Prompt Composer
//!
//! Pure functions from (tensor, task input) to an instruction string. Each
//! template reads only the tensor fields its task needs and ends with an
//! OUTPUT FORMAT contract. Empty descriptors fall back to neutral literals so
//! no template ever interpolates a blank.

use crate::chorus::{DebateRecord, StoryStructure, Thread};
use crate::generation::{AmbientContext, ChatTurn, Premise, ReviewKind};
use crate::tensor::UserTensor;

const STANDARD: &str = "Standard";
const NEUTRAL: &str = "Neutral";
const NONE: &str = "None";
const UNKNOWN: &str = "Unknown";
const UNSPECIFIED: &str = "Unspecified";

/// Characters of story context handed to continuation prompts
pub const SUGGESTION_CONTEXT_CHARS: usize = 3000;
/// Characters of story context handed to the chat partner
pub const CHAT_CONTEXT_CHARS: usize = 2000;
/// Characters of story text handed to thematic analysis
pub const ANALYSIS_CONTENT_CHARS: usize = 10_000;
/// Prior turns included in conversational prompts
const HISTORY_TURNS: usize = 10;

// ============ Helpers ============

fn or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim()
    }
}

fn list_or(items: &[String], fallback: &str) -> String {
    let kept: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if kept.is_empty() {
        fallback.to_string()
    } else {
        kept.join(", ")
    }
}

fn heritage_labels(tensor: &UserTensor) -> String {
    let labels: Vec<String> = tensor
        .cultural_coordinates
        .heritage
        .iter()
        .map(|h| h.label())
        .collect();
    list_or(&labels, UNSPECIFIED)
}

fn primary_place(tensor: &UserTensor) -> &str {
    tensor
        .primary_heritage()
        .map(|h| or(h.place(), UNSPECIFIED))
        .unwrap_or(UNSPECIFIED)
}

fn first_motif(tensor: &UserTensor) -> &str {
    tensor
        .creative_voice
        .recurring_motifs
        .iter()
        .map(|m| m.trim())
        .find(|m| !m.is_empty())
        .unwrap_or("an image of your choosing")
}

/// Last `max_chars` characters of `text`
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &text[start..]
}

/// First `max_chars` characters of `text`
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

fn format_history(history: &[ChatTurn]) -> String {
    let start = history.len().saturating_sub(HISTORY_TURNS);
    let lines: Vec<String> = history[start..]
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| {
            let speaker = if turn.role.eq_ignore_ascii_case("user") { "USER" } else { "AI" };
            format!("{}: {}", speaker, turn.content.trim())
        })
        .collect();
    if lines.is_empty() {
        "(no prior turns)".to_string()
    } else {
        lines.join("\n")
    }
}

// ============ Story Seeds ============

pub fn premise(tensor: &UserTensor) -> String {
    let cc = &tensor.cultural_coordinates;
    let ling = &cc.linguistics;
    let voice = &tensor.creative_voice;
    let emotion = &tensor.emotional_landscape;

    format!(
        r#"You are part of a dual-network system for generating deeply personalized story premises.

UNIVERSAL NETWORK ANALYSIS:
Analyze this writer's emotional state for universal narrative themes:
- Dominant Emotion: {dominant}
- Active Conflicts: {conflicts}
- Processed Themes: {themes}

Identify the universal human experience at the core (e.g. "The burden of expectation", "The silence between generations").

CULTURAL SPECIFICITY NETWORK ANALYSIS:
- Heritage: {heritage}
- Languages: {primary}, {secondary}, {tertiary}
- Code-switching: {frequency} frequency
- Faith Framework: {tradition} ({concepts})
- Intellectual Context: {core_concepts}

Identify the culturally specific nuance that complicates this universal theme: diaspora anxieties, multilingual consciousness, faith and modernity, expectation versus desire.

BLENDING:
Generate one story premise that weaves universal resonance with cultural specificity.

OUTPUT FORMAT:
Output ONLY a JSON object with exactly these keys:
{{
  "title": "A concise, evocative title",
  "logline": "1-2 sentences naming the universal theme and the cultural complication",
  "context": "1 sentence on how this premise emerged from the writer's current state",
  "stylistic_note": "Voice guidance based on: {syntax}, {diction}, metaphors of {motifs}"
}}"#,
        dominant = or(&emotion.current_state.dominant_emotion, NEUTRAL),
        conflicts = list_or(&emotion.active_conflicts, NONE),
        themes = list_or(&emotion.processed_themes, NONE),
        heritage = heritage_labels(tensor),
        primary = or(&ling.primary, "English"),
        secondary = or(&ling.secondary, NONE),
        tertiary = or(&ling.tertiary, NONE),
        frequency = or(&ling.code_switching_patterns.frequency, "Low"),
        tradition = or(&cc.faith_framework.tradition, NONE),
        concepts = list_or(&cc.faith_framework.key_concepts, NONE),
        core_concepts = list_or(&tensor.intellectual_frameworks.core_concepts, NONE),
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        motifs = list_or(&voice.recurring_motifs, NONE),
    )
}

pub fn scene(tensor: &UserTensor, premise: &Premise) -> String {
    let ling = &tensor.cultural_coordinates.linguistics;
    let voice = &tensor.creative_voice;
    let place = primary_place(tensor);
    let secondary = or(&ling.secondary, "the writer's heritage language");
    let frequency = or(&ling.code_switching_patterns.frequency, "Low");
    let code_switching = if frequency.eq_ignore_ascii_case("high") {
        format!(
            "Include at least one word or phrase in {} that English cannot capture, italicized, followed by an English approximation if needed.",
            secondary
        )
    } else {
        "Use code-switching sparingly, only for emotional precision.".to_string()
    };

    format!(
        r#"You are generating a scene where cultural specificity and universal narrative blend seamlessly.

PREMISE TO EXPAND:
Title: {title}
Logline: {logline}

WRITER CONTEXT:
Heritage: {place}
Primary Language: {primary}
Secondary Language: {secondary}
Code-Switching Pattern: {transition}
Code-Switching Frequency: {frequency}
Creative Voice: {syntax}, {diction}
Recurring Motifs: {motifs}
Current Time: {local_time}
Device: {device}

INSTRUCTIONS:
1. Universal scaffold: write 2-3 paragraphs that capture the emotional core of the premise with concrete imagery and internal conflict.
2. Cultural injections: sensory details tied to {place}; family terms in {secondary}; {motif} as a recurring motif.
3. Code-switching: {code_switching}
4. Voice matching: write in a style that is {syntax}, {diction}. Let the current time ({local_time}) colour the light and mood.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "scene": "The complete scene text, with any {secondary} words in *asterisks*",
  "annotations": [
    {{"type": "cultural", "note": "What cultural details you injected and why"}},
    {{"type": "linguistic", "note": "Any code-switching choices and what they accomplish"}}
  ]
}}"#,
        title = or(&premise.title, "Untitled"),
        logline = or(&premise.logline, NONE),
        place = place,
        primary = or(&ling.primary, "English"),
        secondary = secondary,
        transition = or(&ling.code_switching_patterns.emotional_transition, NONE),
        frequency = frequency,
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        motifs = list_or(&voice.recurring_motifs, NONE),
        motif = first_motif(tensor),
        local_time = or(&tensor.contextual_signals.local_time, UNKNOWN),
        device = or(&tensor.contextual_signals.device, UNKNOWN),
        code_switching = code_switching,
    )
}

// ============ Editor Assistance ============

pub fn suggestion(tensor: &UserTensor, current_text: &str, ambient: &AmbientContext) -> String {
    let ling = &tensor.cultural_coordinates.linguistics;
    let voice = &tensor.creative_voice;
    let state = &tensor.emotional_landscape.current_state;
    let switching = &ling.code_switching_patterns;

    format!(
        r#"COMPLETE THE FOLLOWING TEXT.

CONTEXT (the story so far):
"...{context}"

STYLE INSTRUCTIONS:
- Syntax Rhythm: {syntax}
- Diction: {diction}
- Recurring Motifs: {motifs}
- Primary Language: {primary}
- Secondary Language: {secondary}
- Code-Switching: emotional → {emotional}; intellectual → {intellectual}; frequency {frequency}
- Current Emotional State: {dominant} (Valence: {valence})

AMBIENT CONTEXT:
- Time of Day: {time_of_day}
- Local Time: {local_time}

TASK:
Write the next sentence of the story.

CONSTRAINTS:
1. NO NEW CHARACTERS: use only characters already present in the context. Do not invent new names.
2. NO META-COMMENTARY.
3. Mimic the voice described above.
4. Late night leans introspective and quiet; morning leans crisp and alert.
5. If the emotional moment matches the code-switching pattern, use a word in {secondary} and italicize it.

OUTPUT FORMAT:
Output ONLY the next sentence. One sentence, no quotes, no labels."#,
        context = tail_chars(current_text, SUGGESTION_CONTEXT_CHARS),
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        motifs = list_or(&voice.recurring_motifs, NONE),
        primary = or(&ling.primary, "English"),
        secondary = or(&ling.secondary, NONE),
        emotional = or(&switching.emotional_transition, NONE),
        intellectual = or(&switching.intellectual_transition, NONE),
        frequency = or(&switching.frequency, "Low"),
        dominant = or(&state.dominant_emotion, NEUTRAL),
        valence = or(&state.valence, NEUTRAL),
        time_of_day = or(ambient.time_of_day.as_deref().unwrap_or(""), UNKNOWN),
        local_time = or(ambient.local_time.as_deref().unwrap_or(""), UNKNOWN),
    )
}

/// Style transfer. Reads `creative_voice` only.
pub fn rewrite(tensor: &UserTensor, text: &str) -> String {
    let voice = &tensor.creative_voice;
    format!(
        r#"You are a style transfer engine.

TARGET VOICE PROFILE:
- Syntax Rhythm: {syntax}
- Diction: {diction}
- Metaphor Density: {density}
- Recurring Motifs: {motifs}

INPUT TEXT:
"{text}"

TASK:
Rewrite the input text to sound exactly like the target voice.
- Change sentence structure to match the rhythm.
- Swap words for the preferred diction.
- Inject metaphors only as far as the density allows.

OUTPUT FORMAT:
Output ONLY the rewritten text."#,
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        density = or(&voice.metaphor_density, "Medium"),
        motifs = list_or(&voice.recurring_motifs, NONE),
        text = text.trim(),
    )
}

/// Voice match scoring. Reads `creative_voice` only.
pub fn voice_analysis(tensor: &UserTensor, text: &str) -> String {
    let voice = &tensor.creative_voice;
    format!(
        r#"You are a literary voice analyst.

WRITER VOICE PROFILE:
- Syntax Rhythm: {syntax}
- Diction: {diction}
- Metaphor Density: {density}
- Recurring Motifs: {motifs}

TEXT TO ANALYZE:
"{text}"

TASK:
Judge how closely the text matches the established voice profile.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "match_score": 0-100,
  "feedback": "A concise, constructive critique, max 2 sentences, on what is missing or different",
  "suggestion": "One specific change that would align it better"
}}"#,
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        density = or(&voice.metaphor_density, "Medium"),
        motifs = list_or(&voice.recurring_motifs, NONE),
        text = text.trim(),
    )
}

pub fn unwritten_story(tensor: &UserTensor) -> String {
    let voice = &tensor.creative_voice;
    let mut markers: Vec<String> = tensor
        .cultural_coordinates
        .heritage
        .iter()
        .map(|h| h.place().to_string())
        .collect();
    markers.extend(tensor.cultural_coordinates.faith_framework.key_concepts.iter().cloned());

    format!(
        r#"You are a literary mirror. Invent a new story concept that fits inside this writer's established creative identity.

WRITER CREATIVE IDENTITY:
- Recurring Motifs: {motifs}
- Emotional Landscape: {dominant}
- Syntax Rhythm: {syntax}
- Diction: {diction}
- Cultural Markers: {markers}

TASK:
Invent a story this writer would write but has not yet.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "title": "A poetic, evocative title",
  "premise": "A 2-sentence hook describing the core conflict and theme",
  "opening": "The first paragraph (50-70 words), written exactly in the writer's voice"
}}"#,
        motifs = list_or(&voice.recurring_motifs, NONE),
        dominant = or(&tensor.emotional_landscape.current_state.dominant_emotion, NEUTRAL),
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        markers = list_or(&markers, NONE),
    )
}

// ============ Calibration ============

pub fn calibration_turn(tensor: &UserTensor, message: &str, history: &[ChatTurn]) -> String {
    let snapshot = serde_json::to_string_pretty(tensor).unwrap_or_default();
    format!(
        r#"You are the calibration engine for a personalized storytelling system.
Your goal is to interview the writer and refine their creative profile (the "tensor").

CURRENT TENSOR STATE:
{snapshot}

RECENT CONVERSATION:
{history}

WRITER MESSAGE: "{message}"

INSTRUCTIONS:
1. Look for new information about:
   - Cultural background (heritage, languages, faith)
   - Intellectual interests (disciplines, fandoms)
   - Creative voice (style, motifs)
   - Emotional landscape (current feelings, conflicts)
2. If there is new information, build a partial tensor update.
   - Updates replace whole top-level sections, so repeat every field of a section you change.
   - Heritage entries carry "kind": "region" with region/weight/nuance, or "kind": "diaspora" with context/generation/anxieties.
3. Write a natural, empathetic reply that acknowledges the message and asks one follow-up question about a missing or shallow part of the tensor.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "reply": "Your conversational reply",
  "updates": {{ ...partial tensor keyed by top-level section... }} or null
}}"#,
        snapshot = snapshot,
        history = format_history(history),
        message = message.trim(),
    )
}

// ============ Chorus ============

pub fn chorus_debate(tensor: &UserTensor, particle: &str) -> String {
    let places: Vec<String> = tensor
        .cultural_coordinates
        .heritage
        .iter()
        .map(|h| h.place().to_string())
        .collect();
    format!(
        r#"You simulate a chorus of 3 writers debating how to write a story.

AGENTS:
1. Architect: structure, plot beats, causality. Logical.
2. Poet: imagery, sensory detail, metaphor. Emotional.
3. Critic: constraints, pacing, avoiding cliché. Cynical.

WRITER CONTEXT:
- Recurring Motifs: {motifs}
- Emotional State: {dominant}
- Cultural Background: {places}

THE PARTICLE (the constraint):
"{particle}"

TASK:
Simulate roughly 6 turns in which they agree on a beat sheet: the opening, the conflict and the ending.
Keep it fast and specific.

OUTPUT FORMAT:
Output ONLY newline-delimited JSON: one object per line, nothing else.
No markdown, no code fences, no preamble.
{{"agent": "Architect", "content": "..."}}
{{"agent": "Critic", "content": "..."}}
{{"agent": "Poet", "content": "..."}}"#,
        motifs = list_or(&tensor.creative_voice.recurring_motifs, NONE),
        dominant = or(&tensor.emotional_landscape.current_state.dominant_emotion, NEUTRAL),
        places = list_or(&places, UNSPECIFIED),
        particle = particle.trim(),
    )
}

pub fn chorus_structure(tensor: &UserTensor, particle: &str, transcript: &[DebateRecord]) -> String {
    let highlights = if transcript.is_empty() {
        "N/A (generate a new structure)".to_string()
    } else {
        transcript
            .iter()
            .map(|r| format!("{}: {}", r.agent.as_str(), r.content))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"CONTEXT:
A chorus of writers (Architect, Poet, Critic) has debated a story concept for this writer and particle.

WRITER TENSOR:
- Motifs: {motifs}
- Emotion: {dominant}

PARTICLE (constraint): "{particle}"

DEBATE HIGHLIGHTS:
{highlights}

TASK:
Synthesize this into a strict 4-beat structure for parallel generation.
There must be exactly 4 beats, in this order: Opening, Rising Action, Climax, Resolution.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "title": "Story Title",
  "beats": [
    {{"type": "Opening", "instruction": "Establish the setting and a motif. Tone: ..."}},
    {{"type": "Rising Action", "instruction": "Introduce the conflict. Pacing: ..."}},
    {{"type": "Climax", "instruction": "The moment of decision. ..."}},
    {{"type": "Resolution", "instruction": "The aftermath. ..."}}
  ]
}}"#,
        motifs = list_or(&tensor.creative_voice.recurring_motifs, NONE),
        dominant = or(&tensor.emotional_landscape.current_state.dominant_emotion, NEUTRAL),
        particle = particle.trim(),
        highlights = highlights,
    )
}

/// One beat of the outline. Every beat sees the whole outline, never other beats' prose.
pub fn chorus_beat(tensor: &UserTensor, structure: &StoryStructure, index: usize) -> String {
    let voice = &tensor.creative_voice;
    let outline = structure
        .beats
        .iter()
        .enumerate()
        .map(|(i, beat)| format!("{}. {}: {}", i + 1, beat.beat_type.label(), beat.instruction))
        .collect::<Vec<_>>()
        .join("\n");
    let beat = &structure.beats[index.min(structure.beats.len() - 1)];

    format!(
        r#"You are one thread writing ONE specific part of a short story.

STORY TITLE: {title}

FULL STRUCTURE (for context):
{outline}

YOUR TASK:
Write strictly SECTION {number}: {label}.

STYLE GUIDELINES:
- Syntax: {syntax}
- Diction: {diction}
- Motifs to weave in: {motifs}

INSTRUCTION FOR THIS SECTION:
{instruction}

OUTPUT FORMAT:
Output ONLY the prose for this section. No heading, no meta-commentary."#,
        title = or(&structure.title, "Untitled"),
        outline = outline,
        number = index + 1,
        label = beat.beat_type.label(),
        syntax = or(&voice.syntax_rhythm, STANDARD),
        diction = or(&voice.diction, NEUTRAL),
        motifs = list_or(&voice.recurring_motifs, NONE),
        instruction = or(&beat.instruction, "Continue the arc."),
    )
}

/// `threads` must already be in beat order.
pub fn chorus_weave(title: &str, threads: &[Thread]) -> String {
    let draft = threads
        .iter()
        .map(|t| t.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"You are the weaver, an editor responsible for narrative cohesion.
You have {count} sections of a story written by parallel writers. Tone and transitions may be inconsistent.

STORY TITLE: {title}

DRAFT CONTENT:
{draft}

TASK:
Rewrite this into one seamless, polished short story.
1. Smooth the transitions between sections.
2. Keep one consistent tense and point of view.
3. Resolve any plot contradictions introduced by parallel drafting.
4. Keep the original imagery and plot points, in their order.

OUTPUT FORMAT:
Output ONLY the final prose."#,
        count = threads.len(),
        title = or(title, "Untitled"),
        draft = draft,
    )
}

// ============ Analysis ============

pub fn analysis(content: &str) -> String {
    format!(
        r#"Analyze this story for thematic metadata.

STORY:
{content}

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "themes": ["major themes, at most 5"],
  "emotional_valence": "one word such as Melancholic, Hopeful, Tense, Joyful, Nostalgic",
  "motifs": ["recurring imagery, at most 5"],
  "cultural_markers": ["specific cultural references"]
}}"#,
        content = head_chars(content, ANALYSIS_CONTENT_CHARS),
    )
}

// ============ Writing Companion ============

pub fn conversation_starters(tensor: &UserTensor) -> String {
    let emotion = &tensor.emotional_landscape;
    format!(
        r#"Based on this writer's current state, generate 5 conversation starters they might want to explore with a writing assistant.

WRITER CONTEXT:
- Emotional State: {dominant}
- Active Conflicts: {conflicts}
- Recent Themes: {themes}

Each starter is 5-8 words, conversational and specific to this state.

OUTPUT FORMAT:
Output ONLY a JSON array of 5 strings:
["starter 1", "starter 2", "starter 3", "starter 4", "starter 5"]"#,
        dominant = or(&emotion.current_state.dominant_emotion, NEUTRAL),
        conflicts = list_or(&emotion.active_conflicts, NONE),
        themes = list_or(&emotion.processed_themes, NONE),
    )
}

pub fn writing_prompt(tensor: &UserTensor) -> String {
    let emotion = &tensor.emotional_landscape;
    format!(
        r#"Based on this writer's profile, generate one evocative writing prompt.

WRITER PROFILE:
- Emotional State: {dominant}
- Active Conflicts: {conflicts}
- Processed Themes: {themes}
- Recurring Motifs: {motifs}
- Cultural Context: {place}

The prompt (1-2 sentences) connects to their emotional landscape, uses one recurring motif and has cultural specificity.

OUTPUT FORMAT:
Output ONLY the prompt text."#,
        dominant = or(&emotion.current_state.dominant_emotion, NEUTRAL),
        conflicts = list_or(&emotion.active_conflicts, NONE),
        themes = list_or(&emotion.processed_themes, NONE),
        motifs = list_or(&tensor.creative_voice.recurring_motifs, NONE),
        place = primary_place(tensor),
    )
}

pub fn writing_review(tensor: &UserTensor, content: &str, kind: ReviewKind) -> String {
    let voice = &tensor.creative_voice;
    let emotion = &tensor.emotional_landscape;
    match kind {
        ReviewKind::Feedback => format!(
            r#"You are a writing coach giving feedback on this piece.

WRITING:
"{content}"

WRITER VOICE PROFILE:
- Syntax: {syntax}
- Diction: {diction}
- Recurring Motifs: {motifs}
- Cultural Context: {place}

Focus on:
1. How well the unique voice is maintained
2. Moments where cultural specificity could deepen
3. Openings for the recurring motifs
4. Strengths, plus 1-2 specific improvements

OUTPUT FORMAT:
Output ONLY the feedback text, encouraging and specific, at most 3 paragraphs."#,
            content = content.trim(),
            syntax = or(&voice.syntax_rhythm, STANDARD),
            diction = or(&voice.diction, NEUTRAL),
            motifs = list_or(&voice.recurring_motifs, NONE),
            place = primary_place(tensor),
        ),
        ReviewKind::Suggestions => format!(
            r#"Based on this writing, suggest 3 specific next steps.

CURRENT WRITING:
"{content}"

WRITER CONTEXT:
- Emotional themes: {themes}
- Active conflicts: {conflicts}
- Recurring motifs: {motifs}

Each suggestion is 1-2 sentences on how to develop this piece.

OUTPUT FORMAT:
Output ONLY a JSON array of 3 strings:
["Suggestion 1", "Suggestion 2", "Suggestion 3"]"#,
            content = content.trim(),
            themes = list_or(&emotion.processed_themes, NONE),
            conflicts = list_or(&emotion.active_conflicts, NONE),
            motifs = list_or(&voice.recurring_motifs, NONE),
        ),
        ReviewKind::Outline => format!(
            r#"Outline this piece of writing, identifying its structural elements.

WRITING:
"{content}"

Provide:
1. Opening hook or setup (1 sentence)
2. Core tension (1 sentence)
3. Key beats (2-3 bullet points)
4. Emotional arc (1 sentence)

OUTPUT FORMAT:
Output ONLY the outline text, at most 150 words."#,
            content = content.trim(),
        ),
    }
}

pub fn chat_with_context(
    tensor: &UserTensor,
    message: &str,
    current_text: &str,
    history: &[ChatTurn],
) -> String {
    let story = tail_chars(current_text.trim(), CHAT_CONTEXT_CHARS);
    format!(
        r#"You are a creative writing partner and editor.

WRITER PROFILE:
- Style: {syntax}
- Tone: {dominant}

THE STORY SO FAR:
"{story}"

CHAT HISTORY:
{history}

WRITER MESSAGE:
"{message}"

TASK:
Reply to the message. Answer questions about the story from THE STORY SO FAR; offer ideas that fit the current context.

OUTPUT FORMAT:
Output ONLY the reply text, under 3 sentences unless asked for more."#,
        syntax = or(&tensor.creative_voice.syntax_rhythm, STANDARD),
        dominant = or(&tensor.emotional_landscape.current_state.dominant_emotion, NEUTRAL),
        story = or(story, "No content yet."),
        history = format_history(history),
        message = message.trim(),
    )
}

pub fn antimatter(deleted: &[String]) -> String {
    format!(
        r#"You are the antimatter engine, a psychological creative writing coach.

CONTEXT:
The writer keeps deleting text. Here is what they destroyed:
"{deleted}"

TASK:
1. Name why they might be deleting this (insecurity, cliché, too painful).
2. Write a shadow dare: a prompt that makes them write exactly what they avoid, from a new angle.

OUTPUT FORMAT:
Output ONLY a JSON object:
{{
  "insight": "You seem to be avoiding...",
  "dare": "Write the scene again, but this time..."
}}"#,
        deleted = deleted.join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chorus::{Agent, Beat, BeatType};
    use crate::tensor::{HeritageEntry, WeightedRegion};

    fn rich_tensor() -> UserTensor {
        let mut t = UserTensor::default_for("u");
        t.cultural_coordinates.heritage.push(HeritageEntry::Region(WeightedRegion {
            region: "Sindh, Pakistan".into(),
            weight: 0.9,
            nuance: "distinct from Punjab".into(),
        }));
        t.cultural_coordinates.linguistics.secondary = "Urdu".into();
        t.cultural_coordinates.linguistics.code_switching_patterns.frequency = "High".into();
        t.creative_voice.syntax_rhythm = "Controlled, rhythmic".into();
        t.creative_voice.diction = "Elevated but grounded".into();
        t.creative_voice.recurring_motifs = vec!["Mirrors".into(), "Airports".into()];
        t.contextual_signals.local_time = "02:00".into();
        t
    }

    fn structure() -> StoryStructure {
        StoryStructure {
            title: "The Map to Nowhere".into(),
            beats: BeatType::ALL.map(|beat_type| Beat {
                beat_type,
                instruction: format!("Do the {} work", beat_type.label()),
            }),
        }
    }

    #[test]
    fn test_every_template_declares_output_format() {
        let t = rich_tensor();
        let seed = Premise::default();
        let prompts = vec![
            premise(&t),
            scene(&t, &seed),
            suggestion(&t, "She waited.", &AmbientContext::default()),
            rewrite(&t, "text"),
            voice_analysis(&t, "text"),
            unwritten_story(&t),
            calibration_turn(&t, "hi", &[]),
            chorus_debate(&t, "A story about a map to nowhere"),
            chorus_structure(&t, "particle", &[]),
            chorus_beat(&t, &structure(), 2),
            chorus_weave("T", &[]),
            analysis("story"),
            conversation_starters(&t),
            writing_prompt(&t),
            writing_review(&t, "x", ReviewKind::Feedback),
            writing_review(&t, "x", ReviewKind::Suggestions),
            writing_review(&t, "x", ReviewKind::Outline),
            chat_with_context(&t, "m", "", &[]),
            antimatter(&["gone".into()]),
        ];
        for prompt in prompts {
            assert!(prompt.contains("OUTPUT FORMAT:"), "missing contract in: {}", prompt);
        }
    }

    #[test]
    fn test_default_tensor_uses_fallback_literals() {
        let t = UserTensor::default_for("u");
        let p = rewrite(&t, "The rain fell.");
        assert!(p.contains("Syntax Rhythm: Standard"));
        assert!(p.contains("Diction: Neutral"));
        assert!(p.contains("Recurring Motifs: None"));

        let s = scene(&t, &Premise::default());
        assert!(s.contains("Heritage: Unspecified"));
        assert!(s.contains("Current Time: Unknown"));
        assert!(!s.contains(": \n"));
        assert!(!s.contains(": ,"));
    }

    #[test]
    fn test_rewrite_reads_creative_voice_only() {
        let t = rich_tensor();
        let p = rewrite(&t, "The rain fell.");
        assert!(p.contains("Elevated but grounded"));
        assert!(p.contains("Mirrors, Airports"));
        assert!(!p.contains("Sindh"));
        assert!(!p.contains("Urdu"));
    }

    #[test]
    fn test_scene_reads_culture_voice_and_context() {
        let p = scene(&rich_tensor(), &Premise::default());
        assert!(p.contains("Heritage: Sindh, Pakistan"));
        assert!(p.contains("Controlled, rhythmic"));
        assert!(p.contains("Current Time: 02:00"));
        assert!(p.contains("Mirrors as a recurring motif"));
        assert!(p.contains("Include at least one word or phrase in Urdu"));
    }

    #[test]
    fn test_suggestion_keeps_only_recent_context() {
        let long: String = "a".repeat(SUGGESTION_CONTEXT_CHARS) + "THE END";
        let p = suggestion(&rich_tensor(), &long, &AmbientContext::default());
        assert!(p.contains("THE END"));
        assert!(p.contains("NO NEW CHARACTERS"));
        assert!(!p.contains(&"a".repeat(SUGGESTION_CONTEXT_CHARS)));
    }

    #[test]
    fn test_beat_prompt_shares_outline_and_targets_one_section() {
        let p = chorus_beat(&rich_tensor(), &structure(), 1);
        assert!(p.contains("1. Opening: Do the Opening work"));
        assert!(p.contains("4. Resolution: Do the Resolution work"));
        assert!(p.contains("Write strictly SECTION 2: Rising Action."));
    }

    #[test]
    fn test_structure_prompt_lists_transcript() {
        let transcript = vec![DebateRecord {
            agent: Agent::Critic,
            content: "Start in media res.".into(),
        }];
        let p = chorus_structure(&rich_tensor(), "particle", &transcript);
        assert!(p.contains("Critic: Start in media res."));
        assert!(p.contains("exactly 4 beats"));
    }

    #[test]
    fn test_char_windows_respect_boundaries() {
        assert_eq!(tail_chars("ṣabr", 2), "br");
        assert_eq!(head_chars("ṣabr", 2), "ṣa");
        assert_eq!(tail_chars("ab", 5), "ab");
    }

    #[test]
    fn test_history_is_labelled_and_bounded() {
        let history: Vec<ChatTurn> = (0..15)
            .map(|i| ChatTurn {
                role: if i % 2 == 0 { "user".into() } else { "model".into() },
                content: format!("turn {}", i),
            })
            .collect();
        let p = chat_with_context(&rich_tensor(), "next?", "", &history);
        assert!(p.contains("USER: turn 14"));
        assert!(p.contains("AI: turn 13"));
        assert!(!p.contains("turn 4\n"));
        assert!(p.contains("No content yet."));
    }
}
