//! Dependency traversal and pass scheduling.
//!
//! Starting from the writers of the backbuffer, the traversal pulls in every
//! pass transitively required for the frame, tagging edges that could merge
//! into one render pass. The flattened list is then reordered greedily to
//! maximise overlap between independent passes while keeping merge candidates
//! adjacent.

use anyhow::Result;

use crate::error::Error;
use crate::graph::RenderGraph;

/// One group of dependencies to pull in for a pass: the passes that produced
/// (or, for feedback edges, read) a resource.
struct DependencyGroup {
    passes: Vec<usize>,
    resource_name: String,
    /// Readers with no writers are fine (feedback resources).
    no_check: bool,
    /// Skip the depending pass itself (write-after-read edges).
    ignore_self: bool,
    /// This edge could become a subpass dependency.
    merge: bool,
}

impl RenderGraph {
    pub(crate) fn traverse_dependencies(
        &mut self,
        pass_index: usize,
        stack_count: usize,
    ) -> Result<()> {
        let mut groups = Vec::new();

        {
            let pass = &self.passes[pass_index];

            let mut add_group =
                |groups: &mut Vec<DependencyGroup>,
                 resource: usize,
                 readers: bool,
                 no_check: bool,
                 ignore_self: bool,
                 merge: bool| {
                    let res = &self.resources[resource];
                    let set = if readers {
                        &res.read_in_passes
                    } else {
                        &res.written_in_passes
                    };
                    let mut passes: Vec<usize> = set.iter().copied().collect();
                    // Hashed sets again; keep traversal deterministic.
                    passes.sort_unstable();
                    groups.push(DependencyGroup {
                        passes,
                        resource_name: res.name.clone(),
                        no_check,
                        ignore_self,
                        merge,
                    });
                };

            // Pull in these dependencies right away so render passes can be
            // merged if possible.
            if let Some(input) = pass.depth_stencil_input {
                add_group(&mut groups, input, false, false, false, true);
            }

            for &input in &pass.attachment_inputs {
                let self_dependency = pass.depth_stencil_output == Some(input)
                    || pass.color_outputs.contains(&input);
                if !self_dependency {
                    add_group(&mut groups, input, false, false, false, true);
                }
            }

            for input in pass.color_inputs.iter().flatten() {
                add_group(&mut groups, *input, false, false, false, true);
            }

            for input in pass.color_scale_inputs.iter().flatten() {
                add_group(&mut groups, *input, false, false, false, false);
            }

            for input in pass.blit_texture_inputs.iter().flatten() {
                add_group(&mut groups, *input, false, false, false, false);
            }

            for input in &pass.generic_texture {
                add_group(&mut groups, input.resource, false, false, false, false);
            }

            for input in pass.storage_inputs.iter().flatten() {
                // There might be no writer if the buffer is used in a
                // feedback fashion.
                add_group(&mut groups, *input, false, true, false, false);
                // Write-after-read hazard if the buffer is read elsewhere
                // before being updated here.
                add_group(&mut groups, *input, true, true, true, false);
            }

            for input in pass.storage_texture_inputs.iter().flatten() {
                add_group(&mut groups, *input, false, false, false, false);
            }

            for input in &pass.generic_buffer {
                add_group(&mut groups, input.resource, false, true, false, false);
            }
        }

        for group in groups {
            self.depend_passes_recursive(
                pass_index,
                &group.passes,
                &group.resource_name,
                stack_count,
                group.no_check,
                group.ignore_self,
                group.merge,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn depend_passes_recursive(
        &mut self,
        self_index: usize,
        written_passes: &[usize],
        resource_name: &str,
        stack_count: usize,
        no_check: bool,
        ignore_self: bool,
        merge_dependency: bool,
    ) -> Result<()> {
        if !no_check && written_passes.is_empty() {
            return Err(Error::NoWriter(resource_name.to_owned()).into());
        }

        if stack_count > self.passes.len() {
            return Err(Error::DependencyCycle.into());
        }

        for &pass in written_passes {
            if pass != self_index {
                self.pass_dependencies[self_index].insert(pass);
            }
        }

        if merge_dependency {
            for &pass in written_passes {
                if pass != self_index {
                    self.pass_merge_dependencies[self_index].insert(pass);
                }
            }
        }

        let stack_count = stack_count + 1;

        for &pushed_pass in written_passes {
            if ignore_self && pushed_pass == self_index {
                continue;
            } else if pushed_pass == self_index {
                return Err(Error::SelfDependency(self.passes[self_index].name.clone()).into());
            }

            self.pass_stack.push(pushed_pass);
            self.traverse_dependencies(pushed_pass, stack_count)?;
        }
        Ok(())
    }

    pub(crate) fn depends_on_pass(&self, dst_pass: usize, src_pass: usize) -> bool {
        if dst_pass == src_pass {
            return true;
        }
        for &dep in &self.pass_dependencies[dst_pass] {
            if self.depends_on_pass(dep, src_pass) {
                return true;
            }
        }
        false
    }

    pub(crate) fn reorder_passes(&mut self, flattened_passes: &mut Vec<usize>) {
        // If a pass depends on an earlier pass via merge dependencies, copy
        // those dependencies over to the dependees so a merge candidate is
        // never scheduled before the dependencies of its merge target. This
        // is a soft dependency; ignoring it would not be incorrect.
        for pass_index in 0..self.pass_merge_dependencies.len() {
            let merge_deps: Vec<usize> = {
                let mut v: Vec<usize> =
                    self.pass_merge_dependencies[pass_index].iter().copied().collect();
                v.sort_unstable();
                v
            };
            let deps: Vec<usize> = {
                let mut v: Vec<usize> = self.pass_dependencies[pass_index].iter().copied().collect();
                v.sort_unstable();
                v
            };

            for &merge_dep in &merge_deps {
                for &dependee in &deps {
                    // Avoid cycles.
                    if self.depends_on_pass(dependee, merge_dep) {
                        continue;
                    }
                    if merge_dep != dependee {
                        self.pass_dependencies[merge_dep].insert(dependee);
                    }
                }
            }
        }

        if flattened_passes.len() <= 2 {
            return;
        }

        let mut unscheduled_passes = Vec::with_capacity(self.passes.len());
        std::mem::swap(flattened_passes, &mut unscheduled_passes);

        let schedule = |flattened: &mut Vec<usize>, unscheduled: &mut Vec<usize>, index: usize| {
            // Need to preserve the order of the remaining elements.
            flattened.push(unscheduled.remove(index));
        };

        schedule(flattened_passes, &mut unscheduled_passes, 0);
        while !unscheduled_passes.is_empty() {
            // Pick the next pass to schedule. Any pass which does not depend
            // on something still unscheduled before it is legal;
            // unscheduled_passes[0] always works as a fallback.
            //
            // Prefer the pass with the best overlap factor: the number of
            // already scheduled passes between it and the last pass it
            // actually depends on. More overlap means more pipelining.
            let mut best_candidate = 0;
            let mut best_overlap_factor = 0;

            for (i, &candidate) in unscheduled_passes.iter().enumerate() {
                let mut overlap_factor = 0;

                // Always try to merge passes on tilers.
                if self.pass_merge_dependencies[candidate]
                    .contains(flattened_passes.last().unwrap())
                {
                    overlap_factor = !0u32;
                } else {
                    for &scheduled in flattened_passes.iter().rev() {
                        if self.depends_on_pass(candidate, scheduled) {
                            break;
                        }
                        overlap_factor += 1;
                    }
                }

                if overlap_factor <= best_overlap_factor {
                    continue;
                }

                let mut possible_candidate = true;
                for &earlier in &unscheduled_passes[..i] {
                    if self.depends_on_pass(candidate, earlier) {
                        possible_candidate = false;
                        break;
                    }
                }

                if !possible_candidate {
                    continue;
                }

                best_candidate = i;
                best_overlap_factor = overlap_factor;
            }

            schedule(flattened_passes, &mut unscheduled_passes, best_candidate);
        }
    }
}

/// De-duplicate a pass list, keeping the first occurrence of each pass.
pub(crate) fn filter_passes(list: &mut Vec<usize>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|&pass| seen.insert(pass));
}
